//! EPA Configuration System
//!
//! Provides configuration for the EPA bindings:
//! - Integration defaults (tolerances, error step, QAG method, workspace limits)
//! - Native library location
//! - Logging filter
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded and merged in the following order (later overrides earlier):
//! 1. Global config (~/.epa/config.toml)
//! 2. Project config (./epa.toml, searched upwards from the start directory)
//! 3. Environment variables (EPA_*)
//!
//! # Example
//!
//! ```no_run
//! use epa_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! println!("relative error: {}", config.relative_error());
//! ```

pub mod loader;
pub mod settings;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Unknown integration method '{0}'")]
    UnknownMethod(String),

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Re-export main types
pub use loader::{Config, ConfigLoader};
pub use settings::{EpaConfig, IntegrationConfig, IntegrationMethod, LibraryConfig, LoggingConfig};
