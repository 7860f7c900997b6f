//! Platform configuration and log locations

use std::path::PathBuf;

/// Application name used for platform directories
const APP_NAME: &str = "testbed";

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/testbed/`
/// - macOS: `~/Library/Application Support/testbed/`
/// - Windows: `%APPDATA%\testbed\`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the user-wide configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the path to the log directory
pub fn log_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.data_dir().join("logs"))
}

/// Default target for `--log-file` given without a path
pub fn default_log_file() -> Option<PathBuf> {
    log_dir().map(|dir| dir.join("testbed.log"))
}
