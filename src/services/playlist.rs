// Playlist Materializer
// Expands the enabled playlist into a loop manifest covering the target window

use std::path::{Path, PathBuf};
use serde::Serialize;

use crate::models::{StationPipelineConfig, SupervisorSettings};
use crate::services::station_paths::{write_atomic, StationPaths};

/// Sizing parameters for the materialized manifest
#[derive(Debug, Clone, Copy)]
pub struct PlaylistPolicy {
    pub coverage_window_secs: f64,
    pub min_repeats: u32,
    /// Assumed duration for items without a probed duration
    pub fallback_item_secs: f64,
}

impl PlaylistPolicy {
    pub fn from_settings(settings: &SupervisorSettings) -> Self {
        Self {
            coverage_window_secs: settings.coverage_window_secs(),
            min_repeats: settings.min_repeats,
            fallback_item_secs: settings.fallback_item_secs,
        }
    }

    fn item_secs(&self, duration: Option<f64>) -> f64 {
        match duration {
            Some(d) if d.is_finite() && d > 0.0 => d,
            _ => self.fallback_item_secs.max(1.0),
        }
    }

    /// Times the item sequence is written so one pass of the manifest outlasts the window
    pub fn repeat_count(&self, cycle_secs: f64) -> u32 {
        let floor = self.min_repeats.max(1);
        if !cycle_secs.is_finite() || cycle_secs <= 0.0 {
            return floor;
        }
        let needed = (self.coverage_window_secs.max(0.0) / cycle_secs).ceil();
        let needed = if needed >= u32::MAX as f64 { u32::MAX } else { needed as u32 };
        needed.max(floor)
    }
}

impl Default for PlaylistPolicy {
    fn default() -> Self {
        Self::from_settings(&SupervisorSettings::default())
    }
}

/// Result of a materialization pass
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializedPlaylist {
    pub manifest_path: PathBuf,
    /// One cycle of playable items, in order
    pub items: Vec<PathBuf>,
    pub repeat_count: u32,
    pub cycle_duration_secs: f64,
    pub total_duration_secs: f64,
}

/// Quote a path for a concat manifest `file` directive
pub fn escape_manifest_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    format!("'{}'", raw.replace('\'', "'\\''"))
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Write the station manifest and repeat-count side file
///
/// Disabled items are dropped, missing files are skipped with a warning. Fails
/// when nothing playable remains.
pub fn materialize_playlist(
    config: &StationPipelineConfig,
    paths: &StationPaths,
    policy: &PlaylistPolicy,
) -> Result<MaterializedPlaylist, String> {
    let mut items = Vec::new();
    let mut cycle_secs = 0.0;

    for item in config.enabled_items() {
        let path = absolute(&item.path);
        if !path.is_file() {
            log::warn!(
                "[{}] Skipping missing playlist item: {}",
                config.id,
                path.display()
            );
            continue;
        }
        cycle_secs += policy.item_secs(item.duration_secs);
        items.push(path);
    }

    if items.is_empty() {
        return Err(format!("Station {} has no playable playlist items", config.id));
    }

    let repeat_count = policy.repeat_count(cycle_secs);

    let mut manifest = String::new();
    for _ in 0..repeat_count {
        for path in &items {
            manifest.push_str("file ");
            manifest.push_str(&escape_manifest_path(path));
            manifest.push('\n');
        }
    }

    paths.ensure_dir()?;
    let manifest_path = paths.manifest();
    write_atomic(&manifest_path, manifest.as_bytes())?;
    write_atomic(&paths.repeat_count(), format!("{repeat_count}\n").as_bytes())?;

    log::info!(
        "[{}] Materialized playlist: {} items x {} repeats ({:.0}s per cycle)",
        config.id,
        items.len(),
        repeat_count,
        cycle_secs
    );

    Ok(MaterializedPlaylist {
        manifest_path,
        items,
        repeat_count,
        cycle_duration_secs: cycle_secs,
        total_duration_secs: cycle_secs * repeat_count as f64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PlaylistItem;
    use tempfile::tempdir;

    fn item(path: PathBuf, position: i32, duration_secs: Option<f64>) -> PlaylistItem {
        PlaylistItem { path, enabled: true, position, duration_secs }
    }

    #[test]
    fn test_repeat_count_covers_window_with_floor() {
        let policy = PlaylistPolicy {
            coverage_window_secs: 86_400.0,
            min_repeats: 2,
            fallback_item_secs: 300.0,
        };
        assert_eq!(policy.repeat_count(3600.0), 24);
        assert_eq!(policy.repeat_count(7000.0), 13);
        // Cycle longer than the window still loops twice
        assert_eq!(policy.repeat_count(200_000.0), 2);
        assert_eq!(policy.repeat_count(0.0), 2);
    }

    #[test]
    fn test_materialize_writes_manifest_and_side_file() {
        let dir = tempdir().unwrap();
        let media = dir.path().join("media");
        std::fs::create_dir_all(&media).unwrap();
        let a = media.join("a.mp4");
        let b = media.join("it's b.mp4");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();

        let mut config = StationPipelineConfig::new("st-1", "alpha");
        config.playlist = vec![
            item(b.clone(), 2, None),
            item(a.clone(), 1, Some(600.0)),
            item(media.join("gone.mp4"), 3, Some(10.0)),
        ];

        let policy = PlaylistPolicy {
            coverage_window_secs: 3600.0,
            min_repeats: 2,
            fallback_item_secs: 300.0,
        };
        let paths = StationPaths::new(dir.path(), "alpha").unwrap();
        let result = materialize_playlist(&config, &paths, &policy).unwrap();

        assert_eq!(result.items, vec![a.clone(), b.clone()]);
        assert_eq!(result.cycle_duration_secs, 900.0);
        assert_eq!(result.repeat_count, 4);

        let manifest = std::fs::read_to_string(&result.manifest_path).unwrap();
        let lines: Vec<&str> = manifest.lines().collect();
        assert_eq!(lines.len(), 8);
        assert_eq!(lines[0], format!("file '{}'", a.display()));
        assert!(lines[1].ends_with("it'\\''s b.mp4'"));
        assert_eq!(std::fs::read_to_string(paths.repeat_count()).unwrap().trim(), "4");
    }

    #[test]
    fn test_failed_materialize_keeps_previous_manifest() {
        let dir = tempdir().unwrap();
        let paths = StationPaths::new(dir.path(), "alpha").unwrap();
        paths.ensure_dir().unwrap();
        std::fs::write(paths.manifest(), "file '/old.mp4'\n").unwrap();

        let mut config = StationPipelineConfig::new("st-1", "alpha");
        config.playlist = vec![item(dir.path().join("missing.mp4"), 0, None)];

        let err = materialize_playlist(&config, &paths, &PlaylistPolicy::default()).unwrap_err();
        assert!(err.contains("no playable"));
        assert_eq!(std::fs::read_to_string(paths.manifest()).unwrap(), "file '/old.mp4'\n");
    }
}
