// SettingsManager Service
// Handles supervisor settings persistence

use std::path::PathBuf;
use std::sync::RwLock;
use serde_json::Value;

use crate::models::SupervisorSettings;
use crate::services::station_paths::write_atomic;

pub const ENV_FFMPEG_PATH: &str = "STATIONCAST_FFMPEG_PATH";
pub const ENV_HOST: &str = "STATIONCAST_HOST";
pub const ENV_PORT: &str = "STATIONCAST_PORT";

/// Manages settings storage and retrieval
pub struct SettingsManager {
    settings_path: PathBuf,
    cache: RwLock<Option<SupervisorSettings>>,
}

impl SettingsManager {
    /// Create a new SettingsManager rooted at the data directory
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            settings_path: data_dir.join("settings.json"),
            cache: RwLock::new(None),
        }
    }

    /// Load settings from disk, or return defaults if not found
    ///
    /// Keys added since the file was written are filled in from defaults and
    /// persisted back.
    pub fn load(&self) -> Result<SupervisorSettings, String> {
        if let Ok(cache) = self.cache.read() {
            if let Some(ref settings) = *cache {
                return Ok(settings.clone());
            }
        }

        let settings = if self.settings_path.exists() {
            let content = std::fs::read_to_string(&self.settings_path)
                .map_err(|e| format!("Failed to read settings: {e}"))?;

            let mut user_value: Value = serde_json::from_str(&content)
                .map_err(|e| format!("Failed to parse settings: {e}"))?;

            let defaults_value = serde_json::to_value(SupervisorSettings::default())
                .map_err(|e| format!("Failed to build default settings: {e}"))?;

            let changed = merge_missing_settings(&mut user_value, &defaults_value);

            let settings: SupervisorSettings = serde_json::from_value(user_value)
                .map_err(|e| format!("Failed to parse settings: {e}"))?;

            if changed {
                self.save_internal(&settings)?;
            }

            settings
        } else {
            let defaults = SupervisorSettings::default();
            self.save_internal(&defaults)?;
            defaults
        };

        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(settings.clone());
        }

        Ok(settings)
    }

    /// Save settings to disk
    pub fn save(&self, settings: &SupervisorSettings) -> Result<(), String> {
        self.save_internal(settings)?;

        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(settings.clone());
        }

        Ok(())
    }

    fn save_internal(&self, settings: &SupervisorSettings) -> Result<(), String> {
        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| format!("Failed to serialize settings: {e}"))?;
        write_atomic(&self.settings_path, content.as_bytes())
            .map_err(|e| format!("Failed to write settings: {e}"))
    }

    pub fn settings_path(&self) -> &PathBuf {
        &self.settings_path
    }
}

/// Apply `STATIONCAST_*` overrides on top of the file values
pub fn apply_env_overrides(settings: &mut SupervisorSettings) {
    apply_overrides_from(settings, |key| std::env::var(key).ok());
}

fn apply_overrides_from<F>(settings: &mut SupervisorSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(path) = non_empty(ENV_FFMPEG_PATH) {
        settings.ffmpeg_path = path;
    }
    if let Some(host) = non_empty(ENV_HOST) {
        settings.backend_host = host;
    }
    if let Some(port) = non_empty(ENV_PORT) {
        match port.parse::<u16>() {
            Ok(port) => settings.backend_port = port,
            Err(_) => log::warn!("Ignoring invalid {ENV_PORT} value: {port}"),
        }
    }
}

fn merge_missing_settings(target: &mut Value, defaults: &Value) -> bool {
    match (target, defaults) {
        (Value::Object(target_map), Value::Object(defaults_map)) => {
            let mut changed = false;
            for (key, default_value) in defaults_map {
                match target_map.get_mut(key) {
                    Some(target_value) => {
                        if merge_missing_settings(target_value, default_value) {
                            changed = true;
                        }
                    }
                    None => {
                        target_map.insert(key.clone(), default_value.clone());
                        changed = true;
                    }
                }
            }
            changed
        }
        _ => false,
    }
}
