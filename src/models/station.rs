// Station Model
// Per-station pipeline configuration snapshot

use std::path::PathBuf;
use serde::{Deserialize, Serialize};

/// Video encoding settings for the station output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSettings {
    /// Output width in pixels
    pub width: u32,

    /// Output height in pixels
    pub height: u32,

    /// Frame rate (e.g., 30)
    pub fps: u32,

    /// Bitrate with unit (e.g., "4000k", "6M")
    pub bitrate: String,

    /// FFmpeg video encoder
    #[serde(default = "default_video_codec")]
    pub codec: String,

    /// Encoder preset (e.g., "veryfast")
    #[serde(default)]
    pub preset: Option<String>,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            bitrate: "3000k".to_string(),
            codec: default_video_codec(),
            preset: Some("veryfast".to_string()),
        }
    }
}

impl VideoSettings {
    /// Frames per keyframe interval (exactly two seconds of frames)
    pub fn gop_size(&self) -> u32 {
        self.fps.max(1).saturating_mul(2)
    }
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

/// Audio encoding settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSettings {
    /// Bitrate with unit (e.g., "128k")
    pub bitrate: String,

    /// Sample rate in Hz, fixed per station
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            bitrate: "128k".to_string(),
            sample_rate: default_sample_rate(),
        }
    }
}

fn default_sample_rate() -> u32 {
    44100
}

/// Anchor for the now-playing text group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlayPosition {
    #[default]
    BottomLeft,
    BottomCenter,
    BottomRight,
    TopLeft,
    TopCenter,
    TopRight,
}

impl OverlayPosition {
    pub fn is_top(&self) -> bool {
        matches!(self, Self::TopLeft | Self::TopCenter | Self::TopRight)
    }

    pub fn horizontal(&self) -> HorizontalAnchor {
        match self {
            Self::BottomLeft | Self::TopLeft => HorizontalAnchor::Left,
            Self::BottomCenter | Self::TopCenter => HorizontalAnchor::Center,
            Self::BottomRight | Self::TopRight => HorizontalAnchor::Right,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HorizontalAnchor {
    Left,
    Center,
    Right,
}

/// How the track lines are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverlayLayout {
    /// Artist line above title line
    #[default]
    Stacked,
    /// One "Artist - Title" line in the title slot
    SingleLine,
}

/// Text overlay style
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OverlaySettings {
    pub enabled: bool,
    pub position: OverlayPosition,
    pub layout: OverlayLayout,

    /// Named font family; empty means renderer default
    pub font_family: String,

    /// Uploaded font file, takes precedence over the family
    pub font_file: Option<PathBuf>,

    pub font_size: u32,
    pub font_color: String,
    pub shadow_x: i32,
    pub shadow_y: i32,
    pub shadow_color: String,
    pub outline_width: u32,
    pub outline_color: String,

    /// Box color behind the text, none when unset
    pub background_color: Option<String>,

    /// Static label shown above the track lines
    pub label_text: Option<String>,
    pub label_font_size: u32,
    pub label_font_color: String,

    /// Distance from the frame edge in pixels
    pub margin: u32,

    /// Vertical gap between lines in pixels
    pub line_gap: u32,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            position: OverlayPosition::default(),
            layout: OverlayLayout::default(),
            font_family: String::new(),
            font_file: None,
            font_size: 32,
            font_color: "white".to_string(),
            shadow_x: 2,
            shadow_y: 2,
            shadow_color: "black@0.6".to_string(),
            outline_width: 0,
            outline_color: "black".to_string(),
            background_color: None,
            label_text: None,
            label_font_size: 24,
            label_font_color: "white".to_string(),
            margin: 40,
            line_gap: 8,
        }
    }
}

/// Where now-playing metadata comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NowPlayingMode {
    /// Radio automation API with a nested song object
    #[default]
    ExternalApi,
    /// Streaming server status document (object or array of sources)
    StatusEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NowPlayingSource {
    pub mode: NowPlayingMode,

    /// Used in external-api mode
    pub api_url: Option<String>,

    /// Used in status-endpoint mode
    pub status_url: Option<String>,

    pub poll_interval_secs: u64,
}

impl Default for NowPlayingSource {
    fn default() -> Self {
        Self {
            mode: NowPlayingMode::default(),
            api_url: None,
            status_url: None,
            poll_interval_secs: 10,
        }
    }
}

impl NowPlayingSource {
    /// URL for the configured mode, if one is set
    pub fn active_url(&self) -> Option<&str> {
        let url = match self.mode {
            NowPlayingMode::ExternalApi => self.api_url.as_deref(),
            NowPlayingMode::StatusEndpoint => self.status_url.as_deref(),
        };
        url.map(str::trim).filter(|u| !u.is_empty())
    }
}

/// Auto-restart policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestartPolicy {
    pub auto_restart: bool,

    /// Base restart delay in seconds
    pub base_delay_secs: f64,

    pub max_attempts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            auto_restart: true,
            base_delay_secs: 5.0,
            max_attempts: 10,
        }
    }
}

/// Process shape used for the station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineMode {
    /// One transcoder reading the concat manifest
    #[default]
    Single,
    /// Per-item decode feeder piped into a long-lived encoder
    Piped,
}

/// An uploaded media file in the station playlist
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistItem {
    pub path: PathBuf,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sort key; lower plays first
    #[serde(default)]
    pub position: i32,

    /// Probed duration, if known
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

/// A live audio stream candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSource {
    pub url: String,

    /// Lower number wins
    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// An RTMP(S) output destination
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    #[serde(default)]
    pub name: String,

    /// Ingest server URL
    pub url: String,

    /// Stream key appended to the URL, may be `${ENV_VAR}`
    #[serde(default)]
    pub stream_key: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Full configuration snapshot for one station pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationPipelineConfig {
    /// Stable identifier
    pub id: String,

    /// Directory-safe name for on-disk state
    pub slug: String,

    #[serde(default)]
    pub video: VideoSettings,

    #[serde(default)]
    pub audio: AudioSettings,

    #[serde(default)]
    pub overlay: OverlaySettings,

    #[serde(default)]
    pub now_playing: NowPlayingSource,

    #[serde(default)]
    pub restart: RestartPolicy,

    #[serde(default)]
    pub pipeline_mode: PipelineMode,

    #[serde(default)]
    pub playlist: Vec<PlaylistItem>,

    #[serde(default)]
    pub audio_sources: Vec<AudioSource>,

    #[serde(default)]
    pub destinations: Vec<Destination>,
}

impl StationPipelineConfig {
    /// Create a station with default encoding settings and no inputs
    pub fn new(id: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            slug: slug.into(),
            video: VideoSettings::default(),
            audio: AudioSettings::default(),
            overlay: OverlaySettings::default(),
            now_playing: NowPlayingSource::default(),
            restart: RestartPolicy::default(),
            pipeline_mode: PipelineMode::default(),
            playlist: Vec::new(),
            audio_sources: Vec::new(),
            destinations: Vec::new(),
        }
    }

    /// Enabled playlist items in play order
    pub fn enabled_items(&self) -> Vec<&PlaylistItem> {
        let mut items: Vec<&PlaylistItem> = self.playlist.iter().filter(|i| i.enabled).collect();
        items.sort_by_key(|i| i.position);
        items
    }

    /// The enabled audio source with the lowest priority number
    pub fn primary_audio_source(&self) -> Option<&AudioSource> {
        self.audio_sources
            .iter()
            .filter(|s| s.enabled && !s.url.trim().is_empty())
            .min_by_key(|s| s.priority)
    }

    pub fn enabled_destinations(&self) -> Vec<&Destination> {
        self.destinations
            .iter()
            .filter(|d| d.enabled && !d.url.trim().is_empty())
            .collect()
    }
}

fn default_true() -> bool {
    true
}
