// LogManager Service
// Log retention cleanup and tail reads for diagnostics

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Delete `*.log` files older than the retention window; 0 keeps everything
pub fn prune_logs(log_dir: &Path, retention_days: u32) -> Result<usize, String> {
    if retention_days == 0 || !log_dir.exists() {
        return Ok(0);
    }

    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(retention_days as u64 * SECS_PER_DAY))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let entries = fs::read_dir(log_dir).map_err(|e| format!("Failed to read log dir: {e}"))?;
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if !is_log_file(&path) {
            continue;
        }

        let modified = entry
            .metadata()
            .and_then(|metadata| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if modified < cutoff {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("Failed to remove old log {}: {e}", path.display()),
            }
        }
    }

    if removed > 0 {
        log::info!("Pruned {removed} log file(s) older than {retention_days} days");
    }
    Ok(removed)
}

/// Last `max_lines` non-empty lines of the newest log, optionally only lines for one station
pub fn read_recent_logs(log_dir: &Path, max_lines: usize, station_id: Option<&str>) -> Result<Vec<String>, String> {
    let log_file = match find_latest_log_file(log_dir) {
        Some(path) => path,
        None => return Ok(Vec::new()),
    };

    // Supervisor lines carry the station as "[<id>]"
    let tag = station_id.map(|id| format!("[{id}]"));
    read_log_lines(&log_file, max_lines, tag.as_deref())
}

fn is_log_file(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("log")
}

fn find_latest_log_file(log_dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(log_dir).ok()?;
    let mut latest: Option<(PathBuf, SystemTime)> = None;

    for entry in entries.flatten() {
        let path = entry.path();
        if !is_log_file(&path) {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|metadata| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        match latest {
            Some((_, latest_time)) if modified <= latest_time => {}
            _ => latest = Some((path, modified)),
        }
    }

    latest.map(|(path, _)| path)
}

fn read_log_lines(path: &Path, max_lines: usize, tag: Option<&str>) -> Result<Vec<String>, String> {
    let bytes = fs::read(path).map_err(|e| format!("Failed to read log file: {e}"))?;
    let content = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| tag.map_or(true, |tag| line.contains(tag)))
        .collect();

    let start = lines.len().saturating_sub(max_lines);
    Ok(lines[start..].iter().map(|line| line.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_prune_keeps_recent_and_non_log_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("stationcast.log"), "fresh\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "keep\n").unwrap();

        assert_eq!(prune_logs(dir.path(), 14).unwrap(), 0);
        assert_eq!(prune_logs(dir.path(), 0).unwrap(), 0);
        assert_eq!(prune_logs(&dir.path().join("missing"), 14).unwrap(), 0);
        assert!(dir.path().join("stationcast.log").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_read_recent_logs_tails_and_filters() {
        let dir = tempdir().unwrap();
        let lines = [
            "[2026-01-01][10:00:00][stationcast][INFO] [st-1] Pipeline started",
            "",
            "[2026-01-01][10:00:01][pipeline][ERROR] [st-2] ffmpeg: Connection refused",
            "[2026-01-01][10:00:02][stationcast][WARN] [st-1] Restarting in 5.0s (attempt 1/10)",
            "[2026-01-01][10:00:03][stationcast][INFO] Server listening",
        ];
        fs::write(dir.path().join("stationcast.log"), lines.join("\n")).unwrap();

        let tail = read_recent_logs(dir.path(), 2, None).unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail[1].ends_with("Server listening"));

        let st1 = read_recent_logs(dir.path(), 10, Some("st-1")).unwrap();
        assert_eq!(st1.len(), 2);
        assert!(st1.iter().all(|line| line.contains("[st-1]")));

        let empty = tempdir().unwrap();
        assert!(read_recent_logs(empty.path(), 10, None).unwrap().is_empty());
    }
}
