// Station Paths
// Per-station on-disk layout and atomic file replacement

use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const MANIFEST_FILE: &str = "playlist.txt";
const REPEAT_COUNT_FILE: &str = "repeat_count";
const NOW_PLAYING_FILE: &str = "now_playing.txt";
const ARTIST_FILE: &str = "artist.txt";
const TITLE_FILE: &str = "title.txt";
const SNAPSHOT_FILE: &str = "snapshot.jpg";

/// Validate a slug or id before it becomes part of a path
pub fn validate_slug(slug: &str) -> Result<(), String> {
    if slug.is_empty() {
        return Err("Station slug cannot be empty".to_string());
    }
    if slug.contains('/') || slug.contains('\\') {
        return Err("Station slug cannot contain path separators".to_string());
    }
    if slug.contains("..") {
        return Err("Station slug cannot contain '..'".to_string());
    }
    if !slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.') {
        return Err("Station slug can only contain letters, numbers, dots, underscores, and hyphens".to_string());
    }
    if slug.len() > 100 {
        return Err("Station slug too long (max 100 characters)".to_string());
    }
    Ok(())
}

/// Replace `path` with `contents` so readers only ever see the old or the new file
///
/// The temp file lives in the destination directory so the final rename never
/// crosses a filesystem boundary.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), String> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .map_err(|e| format!("Failed to create directory {}: {e}", parent.display()))?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|e| format!("Failed to create temp file in {}: {e}", parent.display()))?;
    tmp.write_all(contents)
        .map_err(|e| format!("Failed to write {}: {e}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| format!("Failed to sync {}: {e}", path.display()))?;
    tmp.persist(path)
        .map_err(|e| format!("Failed to replace {}: {}", path.display(), e.error))?;
    Ok(())
}

/// Directory holding one station's manifest, now-playing files, and snapshot
#[derive(Debug, Clone)]
pub struct StationPaths {
    dir: PathBuf,
}

impl StationPaths {
    pub fn new(stations_root: &Path, slug: &str) -> Result<Self, String> {
        validate_slug(slug)?;
        Ok(Self { dir: stations_root.join(slug) })
    }

    pub fn ensure_dir(&self) -> Result<(), String> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| format!("Failed to create station directory {}: {e}", self.dir.display()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn repeat_count(&self) -> PathBuf {
        self.dir.join(REPEAT_COUNT_FILE)
    }

    /// Combined "Artist - Title" text
    pub fn now_playing(&self) -> PathBuf {
        self.dir.join(NOW_PLAYING_FILE)
    }

    pub fn artist(&self) -> PathBuf {
        self.dir.join(ARTIST_FILE)
    }

    pub fn title(&self) -> PathBuf {
        self.dir.join(TITLE_FILE)
    }

    pub fn snapshot(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    /// Make sure the overlay text files exist before the encoder opens them
    pub fn ensure_now_playing_files(&self) -> Result<(), String> {
        self.ensure_dir()?;
        for path in [self.now_playing(), self.artist(), self.title()] {
            if !path.exists() {
                write_atomic(&path, b"")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_validate_slug_rejects_traversal() {
        assert!(validate_slug("night-owl_fm.2").is_ok());
        assert!(validate_slug("").is_err());
        assert!(validate_slug("../etc").is_err());
        assert!(validate_slug("a/b").is_err());
        assert!(validate_slug("a\\b").is_err());
        assert!(validate_slug("name with space").is_err());
    }

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("file.txt");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");

        // No temp files left behind
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap()).unwrap().flatten().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_ensure_now_playing_files_keeps_existing_text() {
        let dir = tempdir().unwrap();
        let paths = StationPaths::new(dir.path(), "alpha").unwrap();
        paths.ensure_dir().unwrap();
        std::fs::write(paths.title(), "Kept").unwrap();

        paths.ensure_now_playing_files().unwrap();
        assert_eq!(std::fs::read_to_string(paths.title()).unwrap(), "Kept");
        assert_eq!(std::fs::read_to_string(paths.artist()).unwrap(), "");
        assert!(paths.now_playing().exists());
    }
}
