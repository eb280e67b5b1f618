// Text Render Capability
// Detects once whether the FFmpeg build can draw text, cached per supervisor

use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lazily probed, lock-protected drawtext support flag
pub struct TextRenderCapability {
    ffmpeg_path: String,
    cached: Mutex<Option<bool>>,
}

impl TextRenderCapability {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            cached: Mutex::new(None),
        }
    }

    /// Capability with a known answer; no probe is ever run
    pub fn fixed(supported: bool) -> Self {
        Self {
            ffmpeg_path: String::new(),
            cached: Mutex::new(Some(supported)),
        }
    }

    pub async fn supports_drawtext(&self) -> bool {
        let mut cached = self.cached.lock().await;
        if let Some(value) = *cached {
            return value;
        }

        let value = self.probe().await;
        *cached = Some(value);
        value
    }

    /// Forget the cached answer, e.g. after the FFmpeg binary was replaced
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn probe(&self) -> bool {
        if self.ffmpeg_path.is_empty() {
            return false;
        }

        let output = tokio::time::timeout(
            PROBE_TIMEOUT,
            Command::new(&self.ffmpeg_path)
                .args(["-hide_banner", "-filters"])
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match output {
            Ok(Ok(output)) => {
                let listing = format!(
                    "{}{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                );
                let supported = filters_include(&listing, "drawtext");
                if supported {
                    log::info!("FFmpeg supports drawtext, overlays enabled");
                } else {
                    log::warn!("FFmpeg build has no drawtext filter, overlays disabled");
                }
                supported
            }
            Ok(Err(e)) => {
                log::warn!("Failed to probe FFmpeg filters: {e}");
                false
            }
            Err(_) => {
                log::warn!("Timed out probing FFmpeg filters");
                false
            }
        }
    }
}

/// Whether `ffmpeg -filters` output lists the named filter
fn filters_include(listing: &str, filter: &str) -> bool {
    listing
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(filter))
}
