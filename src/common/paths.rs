//! Platform configuration and data paths

use std::path::PathBuf;

/// Name used for the configuration and data directories
const APP_NAME: &str = "scenario-harness";

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/scenario-harness/`
/// - macOS: `~/Library/Application Support/scenario-harness/`
/// - Windows: `%APPDATA%\scenario-harness\`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Root for run directories when no artifacts dir is configured
pub fn default_artifacts_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.data_dir().join("runs"))
        .unwrap_or_else(|| std::env::temp_dir().join(APP_NAME))
}
