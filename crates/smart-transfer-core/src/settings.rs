// SPDX-License-Identifier: AGPL-3.0
// Smart Transfer Core - Settings persistence
//
// Engine tunables are stored in a local JSON file.
// Runtime state (devices, jobs, file records) is never persisted here.

use crate::types::{CoreError, CoreResult, CoreSettings};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// In-memory cache of settings, persisted to disk on changes
pub struct SettingsStore {
    settings: RwLock<CoreSettings>,
    file_path: PathBuf,
}

impl SettingsStore {
    /// Open the store in the platform config directory
    pub fn new() -> CoreResult<Self> {
        let file_path = Self::default_settings_path()?;
        Self::open(file_path)
    }

    /// Open the store at an explicit path, loading from disk if available
    pub fn open(file_path: impl Into<PathBuf>) -> CoreResult<Self> {
        let file_path = file_path.into();
        tracing::info!("Settings file path: {:?}", file_path);

        let settings = if file_path.exists() {
            tracing::info!("Loading settings from disk");
            let content = fs::read_to_string(&file_path)
                .map_err(|e| CoreError::FileIo(format!("Failed to read settings: {}", e)))?;

            match serde_json::from_str::<CoreSettings>(&content) {
                Ok(settings) => match settings.validate() {
                    Ok(()) => settings,
                    Err(e) => {
                        tracing::warn!("Settings rejected, using defaults: {}", e);
                        CoreSettings::default()
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to parse settings, using defaults: {}", e);
                    CoreSettings::default()
                }
            }
        } else {
            tracing::info!("No settings file found, using defaults");
            CoreSettings::default()
        };

        let store = Self {
            settings: RwLock::new(settings),
            file_path,
        };

        if !store.file_path.exists() {
            tracing::info!("Creating initial settings file");
            store.persist()?;
        }

        Ok(store)
    }

    fn default_settings_path() -> CoreResult<PathBuf> {
        let config_dir = directories::ProjectDirs::from("com", "smarttransfer", "core")
            .ok_or_else(|| CoreError::FileIo("Could not determine config directory".to_string()))?
            .config_dir()
            .to_path_buf();

        Ok(config_dir.join("settings.json"))
    }

    fn persist(&self) -> CoreResult<()> {
        let content = {
            let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
            serde_json::to_string_pretty(&*settings).map_err(|e| {
                CoreError::Serialization(format!("Failed to serialize settings: {}", e))
            })?
        };

        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CoreError::FileIo(format!("Failed to create config dir: {}", e)))?;
        }

        fs::write(&self.file_path, content)
            .map_err(|e| CoreError::FileIo(format!("Failed to write settings: {}", e)))?;

        Ok(())
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Get current settings
    pub fn get(&self) -> CoreSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate, replace and persist settings
    pub fn update(&self, new_settings: CoreSettings) -> CoreResult<()> {
        new_settings.validate()?;
        {
            let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
            *settings = new_settings;
        }

        let result = self.persist();
        if result.is_ok() {
            tracing::info!("Settings persisted successfully");
        } else {
            tracing::error!("Failed to persist settings: {:?}", result);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_file_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let store = SettingsStore::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.get(), CoreSettings::default());
    }

    #[test]
    fn test_update_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = SettingsStore::open(&path).unwrap();
        let mut settings = store.get();
        settings.log_retention = 10;
        settings.block_transfers_on_unstable = true;
        store.update(settings).unwrap();

        let reopened = SettingsStore::open(&path).unwrap();
        assert_eq!(reopened.get().log_retention, 10);
        assert!(reopened.get().block_transfers_on_unstable);
    }

    #[test]
    fn test_update_rejects_invalid_settings() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path().join("settings.json")).unwrap();

        let mut settings = store.get();
        settings.link_flip_probability = -0.1;
        assert!(store.update(settings).is_err());
        assert_eq!(store.get().link_flip_probability, 0.3);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        let store = SettingsStore::open(&path).unwrap();
        assert_eq!(store.get(), CoreSettings::default());
    }
}
