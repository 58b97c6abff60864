use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
    time::Duration,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerSettings {
    pub tick_interval_ms: u64,
    pub capture_interval_secs: u64,
    pub capture_timeout_secs: u64,
    pub event_buffer: usize,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            capture_interval_secs: 5 * 60,
            capture_timeout_secs: 30,
            event_buffer: 256,
        }
    }
}

impl TrackerSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_secs(self.capture_interval_secs.max(1))
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CaptureSettings {
    /// Image file an external screen grabber keeps refreshed.
    pub snapshot_path: Option<PathBuf>,
    /// Where uploaded captures are written; defaults to `<data dir>/blobs`.
    pub blob_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct UserSettings {
    tracker: TrackerSettings,
    capture: CaptureSettings,
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<UserSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!(
                    "Ignoring unreadable settings in {}: {err}; using defaults",
                    path.display()
                );
                UserSettings::default()
            })
        } else {
            UserSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tracker(&self) -> TrackerSettings {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tracker
            .clone()
    }

    pub fn capture(&self) -> CaptureSettings {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .capture
            .clone()
    }

    pub fn update_tracker(&self, settings: TrackerSettings) -> Result<()> {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        guard.tracker = settings;
        self.persist(&guard)
    }

    pub fn update_capture(&self, settings: CaptureSettings) -> Result<()> {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        guard.capture = settings;
        self.persist(&guard)
    }

    fn persist(&self, data: &UserSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create settings directory {}", parent.display())
            })?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json")).unwrap();

        let tracker = store.tracker();
        assert_eq!(tracker.tick_interval(), Duration::from_secs(1));
        assert_eq!(tracker.capture_interval(), Duration::from_secs(300));
        assert_eq!(store.capture(), CaptureSettings::default());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "tracker": { "capture_interval_secs": 60 } }"#).unwrap();

        let tracker = SettingsStore::new(path).unwrap().tracker();
        assert_eq!(tracker.capture_interval_secs, 60);
        assert_eq!(tracker.tick_interval_ms, 1_000);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        assert_eq!(SettingsStore::new(path).unwrap().tracker(), TrackerSettings::default());
    }

    #[test]
    fn updates_are_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let store = SettingsStore::new(path.clone()).unwrap();
        store
            .update_capture(CaptureSettings {
                snapshot_path: Some(PathBuf::from("/tmp/screen.png")),
                blob_dir: None,
            })
            .unwrap();

        let reopened = SettingsStore::new(path).unwrap();
        assert_eq!(
            reopened.capture().snapshot_path,
            Some(PathBuf::from("/tmp/screen.png"))
        );
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let settings = TrackerSettings {
            tick_interval_ms: 0,
            capture_interval_secs: 0,
            capture_timeout_secs: 0,
            event_buffer: 1,
        };
        assert_eq!(settings.tick_interval(), Duration::from_millis(1));
        assert_eq!(settings.capture_interval(), Duration::from_secs(1));
        assert_eq!(settings.capture_timeout(), Duration::from_secs(1));
    }
}
