//! Configuration module
//!
//! Handles application settings and the port bindings sessions are built from

mod settings;

pub use settings::{AppConfig, LoggingConfig, SessionConfig, SupervisorConfig};

use crate::core::port::PortConfig;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("{path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config could not be rendered as TOML
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// No home directory to place the config in
    #[error("could not determine config directory")]
    NoConfigDir,

    /// Values parse but cannot be used
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Supplies port configurations to the supervisor
#[cfg_attr(test, mockall::automock)]
pub trait PortConfigSource {
    /// Every configured port
    fn port_configs(&self) -> Result<Vec<PortConfig>, ConfigError>;
}

impl PortConfigSource for Vec<PortConfig> {
    fn port_configs(&self) -> Result<Vec<PortConfig>, ConfigError> {
        Ok(self.clone())
    }
}

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "instrulink", "Instrulink")
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the application data directory
pub fn data_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "instrulink", "Instrulink")
        .map(|dirs| dirs.data_dir().to_path_buf())
}

/// Get the log directory
pub fn log_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("logs"))
}

/// Initialize application directories
pub fn init_directories() -> std::io::Result<()> {
    if let Some(dir) = config_dir() {
        std::fs::create_dir_all(&dir)?;
    }
    if let Some(dir) = log_dir() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(())
}
