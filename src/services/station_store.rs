// StationStore Service
// Read access to station configuration, backed by one JSON file per station

use std::path::PathBuf;

use crate::models::StationPipelineConfig;
use crate::services::station_paths::{validate_slug, write_atomic};

/// Source of per-station configuration snapshots
pub trait StationStore: Send + Sync {
    /// Full configuration for a station, `None` when it does not exist
    fn load_config(&self, station_id: &str) -> Result<Option<StationPipelineConfig>, String>;

    /// Directory name for the station's on-disk state
    fn slug_for(&self, station_id: &str) -> Result<Option<String>, String> {
        Ok(self.load_config(station_id)?.map(|config| config.slug))
    }
}

/// Stores each station as `<stations_dir>/<id>.json`
pub struct JsonStationStore {
    stations_dir: PathBuf,
}

impl JsonStationStore {
    pub fn new(stations_dir: PathBuf) -> Self {
        Self { stations_dir }
    }

    fn station_path(&self, station_id: &str) -> Result<PathBuf, String> {
        validate_slug(station_id).map_err(|e| format!("Invalid station id: {e}"))?;
        Ok(self.stations_dir.join(format!("{station_id}.json")))
    }

    pub fn save(&self, config: &StationPipelineConfig) -> Result<(), String> {
        validate_slug(&config.slug)?;
        let path = self.station_path(&config.id)?;
        let content = serde_json::to_string_pretty(config)
            .map_err(|e| format!("Failed to serialize station: {e}"))?;
        write_atomic(&path, content.as_bytes())
    }

    pub fn delete(&self, station_id: &str) -> Result<bool, String> {
        let path = self.station_path(station_id)?;
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)
            .map_err(|e| format!("Failed to delete station {station_id}: {e}"))?;
        Ok(true)
    }

    /// Ids of every stored station, sorted
    pub fn list(&self) -> Result<Vec<String>, String> {
        if !self.stations_dir.exists() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&self.stations_dir)
            .map_err(|e| format!("Failed to read stations directory: {e}"))?;

        let mut ids: Vec<String> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("json"))
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

impl StationStore for JsonStationStore {
    fn load_config(&self, station_id: &str) -> Result<Option<StationPipelineConfig>, String> {
        let path = self.station_path(station_id)?;
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read station {station_id}: {e}"))?;
        let config: StationPipelineConfig = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse station {station_id}: {e}"))?;

        if config.id != station_id {
            return Err(format!(
                "Station file {station_id}.json declares id '{}'",
                config.id
            ));
        }
        validate_slug(&config.slug)?;
        Ok(Some(config))
    }
}
