//! Execution settings persistence.
//!
//! Settings are stored as JSON in the user's config directory:
//! - macOS: ~/Library/Application Support/runt-cell-outputs/settings.json
//! - Linux: ~/.config/runt-cell-outputs/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\runt-cell-outputs\settings.json

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

/// Knobs for a cell execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Upper bound on one execute request, in seconds. `None` waits forever.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,

    /// Upper bound on waiting for the kernel to become ready, in seconds.
    #[serde(default)]
    pub ready_timeout_secs: Option<u64>,

    /// Clear the cell's previous outputs when an execution starts
    #[serde(default = "default_true")]
    pub clear_output_on_start: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: None,
            ready_timeout_secs: None,
            clear_output_on_start: true,
        }
    }
}

impl ExecutionSettings {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_secs.map(Duration::from_secs)
    }
}

/// Get the path to the default settings file
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("runt-cell-outputs")
        .join("settings.json")
}

/// Load settings from `path`, returning defaults if the file doesn't exist.
pub fn load_settings(path: &Path) -> Result<ExecutionSettings, SettingsError> {
    if !path.exists() {
        return Ok(ExecutionSettings::default());
    }
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Write settings to `path`, creating parent directories as needed.
pub fn save_settings(path: &Path, settings: &ExecutionSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings, ExecutionSettings::default());
        assert!(settings.clear_output_on_start);
        assert_eq!(settings.request_timeout(), None);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"request_timeout_secs": 30}"#).unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.request_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(settings.ready_timeout_secs, None);
        assert!(settings.clear_output_on_start);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(load_settings(&path), Err(SettingsError::Parse(_))));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = ExecutionSettings {
            request_timeout_secs: Some(5),
            ready_timeout_secs: Some(2),
            clear_output_on_start: false,
        };

        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path).unwrap(), settings);
    }

    #[test]
    fn test_default_path_is_settings_json() {
        assert!(default_settings_path().ends_with("runt-cell-outputs/settings.json"));
    }
}
