use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use crate::alarm::NewAlarm;

pub const DATA_DIR_ENV: &str = "KATANA_DATA_DIR";
const DEFAULT_DATA_DIR: &str = "data";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub notification_threshold_hours: f64,
    pub timer_update_interval_ms: u64,
    pub alarm_check_interval_ms: u64,
    pub max_activity_length: usize,
    pub max_tag_length: usize,
    pub max_tags: usize,
    pub sounds_dir: PathBuf,
    pub alarm_sound_duration_secs: u64,
    pub long_session_sound: String,
    pub long_session_sound_secs: u64,
    pub desktop_notifications: bool,
    /// Alarms the daemon arms at startup.
    pub alarms: Vec<NewAlarm>,
    pub auto_export_enabled: bool,
    pub export_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            notification_threshold_hours: 2.0,
            timer_update_interval_ms: 500,
            alarm_check_interval_ms: 1000,
            max_activity_length: 100,
            max_tag_length: 20,
            max_tags: 5,
            sounds_dir: PathBuf::from("assets/sounds"),
            alarm_sound_duration_secs: 5 * 60,
            long_session_sound: "Classic Alarm 995".into(),
            long_session_sound_secs: 2,
            desktop_notifications: true,
            alarms: Vec::new(),
            auto_export_enabled: false,
            export_path: PathBuf::from("."),
        }
    }
}

impl Config {
    pub fn notification_threshold(&self) -> Duration {
        let secs = self.notification_threshold_hours * 3600.0;
        if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.timer_update_interval_ms.max(10))
    }

    pub fn alarm_check_interval(&self) -> Duration {
        Duration::from_millis(self.alarm_check_interval_ms.max(10))
    }

    pub fn alarm_sound_duration(&self) -> Duration {
        Duration::from_secs(self.alarm_sound_duration_secs)
    }

    pub fn long_session_sound_duration(&self) -> Duration {
        Duration::from_secs(self.long_session_sound_secs)
    }
}

/// Resolves the data directory, honouring `KATANA_DATA_DIR`.
pub fn data_dir() -> PathBuf {
    std::env::var_os(DATA_DIR_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

pub struct ConfigStore {
    path: PathBuf,
    data: RwLock<Config>,
}

impl ConfigStore {
    /// Opens `<dir>/config.json`, writing the defaults when the file is missing.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
        let path = dir.join(CONFIG_FILE);

        if !path.exists() {
            let store = Self {
                path,
                data: RwLock::new(Config::default()),
            };
            store.persist(&Config::default())?;
            return Ok(store);
        }

        let data = match read_config(&path) {
            Ok(config) => config,
            Err(err) => {
                warn!("Using default configuration: {err:#}");
                Config::default()
            }
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Config {
        self.read().clone()
    }

    pub fn update(&self, apply: impl FnOnce(&mut Config)) -> Result<()> {
        let mut guard = self.write();
        apply(&mut guard);
        self.persist(&guard)
    }

    pub fn reload(&self) -> Result<()> {
        let data = read_config(&self.path)?;
        *self.write() = data;
        Ok(())
    }

    fn persist(&self, data: &Config) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write config to {}", self.path.display()))
    }

    fn read(&self) -> RwLockReadGuard<'_, Config> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Config> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn read_config(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse config at {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();

        assert!(store.path().exists());
        assert_eq!(store.get(), Config::default());
        assert_eq!(store.get().tick_interval(), Duration::from_millis(500));
        assert_eq!(
            store.get().notification_threshold(),
            Duration::from_secs(2 * 3600)
        );
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{ "max_tags": 3, "notification_threshold_hours": 0.5 }"#,
        )
        .unwrap();

        let config = ConfigStore::open(dir.path()).unwrap().get();
        assert_eq!(config.max_tags, 3);
        assert_eq!(config.notification_threshold(), Duration::from_secs(1800));
        assert_eq!(config.max_tag_length, 20);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{ not json").unwrap();

        let store = ConfigStore::open(dir.path()).unwrap();
        assert_eq!(store.get(), Config::default());
        assert!(store.reload().is_err());
    }

    #[test]
    fn update_persists_and_reload_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        store.update(|config| config.max_tags = 9).unwrap();

        let reopened = ConfigStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get().max_tags, 9);
        reopened.reload().unwrap();
        assert_eq!(reopened.get().max_tags, 9);
    }
}
