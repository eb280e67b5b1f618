// Settings Model
// Supervisor-wide configuration and policy parameters

use std::time::Duration;
use serde::{Deserialize, Serialize};

fn default_log_retention_days() -> u32 {
    14
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backend_port() -> u16 {
    8010
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_backoff_cap_secs() -> f64 {
    60.0
}

fn default_restart_settle_secs() -> f64 {
    1.5
}

fn default_stop_grace_secs() -> f64 {
    5.0
}

fn default_coverage_window_hours() -> f64 {
    24.0
}

fn default_min_repeats() -> u32 {
    2
}

fn default_fallback_item_secs() -> f64 {
    300.0
}

fn default_metadata_timeout_secs() -> f64 {
    5.0
}

fn default_snapshot_timeout_secs() -> f64 {
    20.0
}

/// Supervisor settings persisted in settings.json
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorSettings {
    // FFmpeg
    /// Explicit FFmpeg binary; empty means discover on PATH
    #[serde(default)]
    pub ffmpeg_path: String,

    // Restart policy
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: f64,
    #[serde(default = "default_restart_settle_secs")]
    pub restart_settle_secs: f64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: f64,

    // Playlist sizing
    #[serde(default = "default_coverage_window_hours")]
    pub coverage_window_hours: f64,
    #[serde(default = "default_min_repeats")]
    pub min_repeats: u32,
    #[serde(default = "default_fallback_item_secs")]
    pub fallback_item_secs: f64,

    // External calls
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: f64,
    #[serde(default = "default_snapshot_timeout_secs")]
    pub snapshot_timeout_secs: f64,

    // Log retention
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,

    // Local control server
    #[serde(default = "default_backend_host")]
    pub backend_host: String,
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: String::new(),
            backoff_factor: default_backoff_factor(),
            backoff_cap_secs: default_backoff_cap_secs(),
            restart_settle_secs: default_restart_settle_secs(),
            stop_grace_secs: default_stop_grace_secs(),
            coverage_window_hours: default_coverage_window_hours(),
            min_repeats: default_min_repeats(),
            fallback_item_secs: default_fallback_item_secs(),
            metadata_timeout_secs: default_metadata_timeout_secs(),
            snapshot_timeout_secs: default_snapshot_timeout_secs(),
            log_retention_days: default_log_retention_days(),
            backend_host: default_backend_host(),
            backend_port: default_backend_port(),
        }
    }
}

impl SupervisorSettings {
    pub fn restart_settle(&self) -> Duration {
        secs(self.restart_settle_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        secs(self.stop_grace_secs)
    }

    pub fn metadata_timeout(&self) -> Duration {
        secs(self.metadata_timeout_secs)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        secs(self.snapshot_timeout_secs)
    }

    pub fn coverage_window_secs(&self) -> f64 {
        self.coverage_window_hours.max(0.0) * 3600.0
    }
}

/// Negative or non-finite values collapse to zero
pub fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}
