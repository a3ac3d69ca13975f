//! Path utilities for courier
//!
//! Handles XDG Base Directory specification compliance for the config and
//! state directories.

use std::path::PathBuf;

use directories::ProjectDirs;

/// Application identifier for XDG directories
const APP_NAME: &str = "courier";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

/// Get the configuration directory
///
/// Location: `$XDG_CONFIG_HOME/courier` or `~/.config/courier`
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| home_fallback(".config"))
}

/// Get the main configuration file path
///
/// Location: `$XDG_CONFIG_HOME/courier/config.toml`
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Get the state directory
///
/// Location: `$XDG_STATE_HOME/courier` or `~/.local/state/courier`
pub fn state_dir() -> PathBuf {
    project_dirs()
        .and_then(|p| p.state_dir().map(|d| d.to_path_buf()))
        .unwrap_or_else(|| home_fallback(".local/state"))
}

/// Get the log directory
///
/// Location: `$XDG_STATE_HOME/courier/log`
pub fn log_dir() -> PathBuf {
    state_dir().join("log")
}

fn home_fallback(relative: &str) -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(relative)
        .join(APP_NAME)
}
