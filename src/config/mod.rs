//! Configuration module
//!
//! Handles the link configuration file

mod settings;

pub use settings::{ConfigError, LinkConfig, LoggingConfig};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "buslink", "Buslink").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Default configuration file
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}
