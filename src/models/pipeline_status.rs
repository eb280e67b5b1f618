// PipelineStatus Model
// Lifecycle state reported for each station pipeline

use std::fmt;
use serde::{Deserialize, Serialize};

/// Discrete lifecycle state of a station pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    #[default]
    Stopped,
    Starting,
    Running,
    Restarting,
    Error,
}

impl PipelineState {
    /// States in which a new start request is a no-op
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status snapshot returned to API callers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub station_id: String,
    pub state: PipelineState,

    /// PID of the primary process
    pub pid: Option<u32>,

    pub restart_count: u32,
    pub max_restart_attempts: u32,
    pub uptime_seconds: u64,
    pub last_error: Option<String>,

    /// An automatic restart timer is pending
    pub restart_pending: bool,
    pub next_restart_in_seconds: Option<f64>,

    /// The pipeline failed and no further automatic attempts will be made
    pub restarts_exhausted: bool,
}

impl PipelineStatus {
    /// Default record for a station that was never started
    pub fn never_started(station_id: &str) -> Self {
        Self {
            station_id: station_id.to_string(),
            ..Default::default()
        }
    }
}
