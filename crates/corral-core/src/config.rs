//! Settings resolution for corral.
//!
//! Settings come from three layers, lowest priority first:
//! 1. Built-in defaults
//! 2. An optional JSON settings file (`--config path/to/settings.json`)
//! 3. Environment variables / CLI arguments (applied by the binary)

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Complete corral settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub logging: LogSettings,
}

/// Pool sizing and scheduling settings.
///
/// These are raw values as read from disk; clamping and auto-sizing happen
/// when they are turned into a pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Total weight budget. 0 means auto (half the CPU cores, minimum 1).
    pub capacity: u32,
    /// CPU cap percent applied to each job via the limiter sidecar.
    /// 0 disables throttling.
    pub cpu_limit_percent: u32,
    /// Scheduler poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum number of jobs waiting to start.
    pub queue_depth: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: 0, // auto
            cpu_limit_percent: 75,
            poll_interval_ms: 500,
            queue_depth: 64,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let settings: Self = serde_json::from_str(&raw)?;
        debug!(path = %path.display(), "Loaded settings file");
        Ok(settings)
    }

    /// Load settings from an optional path, falling back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.pool.capacity, 0);
        assert_eq!(settings.pool.cpu_limit_percent, 75);
        assert_eq!(settings.pool.poll_interval_ms, 500);
        assert_eq!(settings.pool.queue_depth, 64);
        assert_eq!(settings.logging.level, "info");
        assert!(!settings.logging.json);
    }

    #[test]
    fn load_or_default_without_path() {
        let settings = Settings::load_or_default(None).unwrap();
        assert_eq!(settings.pool.cpu_limit_percent, 75);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"pool": {{"capacity": 4}}}}"#).unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.pool.capacity, 4);
        // Unspecified fields keep their defaults
        assert_eq!(settings.pool.cpu_limit_percent, 75);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = Settings::load(Path::new("/nonexistent/settings.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn malformed_json_is_a_json_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = Settings::load(file.path()).unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }
}
