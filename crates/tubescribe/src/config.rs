//! Host-process configuration.
//!
//! Settings are plain JSON; every field carries a sensible default,
//! so a partial (or absent) file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::worker::WorkerOptions;

/// Queue service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Where the SQLite queue database lives.
    pub database_path: PathBuf,
    /// Failed attempts allowed before a job is permanently failed.
    pub max_retries: u32,
    /// Seconds between polls when the queue is empty.
    pub poll_interval_secs: u64,
    /// Base of the exponential retry backoff, in seconds.
    pub initial_retry_delay_secs: u64,
    /// Seconds between observer heartbeats.
    pub heartbeat_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: crate::db::default_database_path()
                .unwrap_or_else(|| PathBuf::from("queue/queue.db")),
            max_retries: 3,
            poll_interval_secs: 5,
            initial_retry_delay_secs: 5,
            heartbeat_interval_secs: 30,
        }
    }
}

impl Settings {
    /// Loads settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Loads from the given file if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_secs(self.initial_retry_delay_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Worker tuning derived from these settings.
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            max_retries: self.max_retries,
            initial_retry_delay: self.initial_retry_delay(),
            poll_interval: self.poll_interval(),
            ..WorkerOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_values() {
        let settings = Settings::default();
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.poll_interval_secs, 5);
        assert_eq!(settings.initial_retry_delay_secs, 5);
        assert_eq!(settings.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, r#"{{ "max_retries": 5 }}"#).unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.poll_interval_secs, 5);
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(Settings::load(Path::new("/nonexistent/settings.json")).is_err());
    }

    #[test]
    fn test_load_or_default_without_file() {
        let settings =
            Settings::load_or_default(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_worker_options_derivation() {
        let settings = Settings {
            max_retries: 7,
            poll_interval_secs: 2,
            initial_retry_delay_secs: 1,
            ..Default::default()
        };

        let options = settings.worker_options();
        assert_eq!(options.max_retries, 7);
        assert_eq!(options.poll_interval, Duration::from_secs(2));
        assert_eq!(options.initial_retry_delay, Duration::from_secs(1));
    }
}
