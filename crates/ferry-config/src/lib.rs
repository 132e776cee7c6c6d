//! Ferry Configuration System
//!
//! Provides configuration for the ferry FFI runtime:
//! - Linker settings (ABI override, by-value aggregate limit, upcall policy)
//! - Arena defaults (scope mode, maximum allocation alignment)
//! - Logging (tracing filter, output format)
//!
//! # Precedence
//!
//! Each layer overrides the one before it:
//! 1. Built-in defaults
//! 2. `ferry.toml`, found by walking up from a start directory
//! 3. `FERRY_ABI`, `FERRY_MAX_AGGREGATE` and `FERRY_LOG`
//!
//! # Example
//!
//! ```no_run
//! use ferry_config::ConfigLoader;
//! use std::path::Path;
//!
//! let config = ConfigLoader::new().load_from_directory(Path::new("."))?;
//! println!("aggregate limit: {}", config.linker.max_by_value_aggregate);
//! # Ok::<(), ferry_config::ConfigError>(())
//! ```

pub mod config;
pub mod loader;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No configuration at {0}")]
    NotFound(PathBuf),

    #[error("Cannot read configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    /// Create an invalid value error
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Re-export main types
pub use config::{
    AbiName, ArenaConfig, FerryConfig, LinkerConfig, LoggingConfig, ScopeModeName,
    DEFAULT_MAX_ALIGNMENT, DEFAULT_MAX_BY_VALUE_AGGREGATE,
};
pub use loader::{ConfigLoader, CONFIG_FILE_NAME};
