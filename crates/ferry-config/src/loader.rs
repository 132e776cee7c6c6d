//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::config::{AbiName, FerryConfig};
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};

/// File name searched for when loading from a directory
pub const CONFIG_FILE_NAME: &str = "ferry.toml";

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Built-in defaults - lowest priority
/// 2. ferry.toml - overrides defaults
/// 3. Environment variables (FERRY_*) - overrides the file
#[derive(Debug, Default)]
pub struct ConfigLoader {
    /// Skip environment overrides (used by embedders that own the environment)
    ignore_env: bool,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { ignore_env: false }
    }

    /// Do not consult FERRY_* variables
    pub fn without_env(mut self) -> Self {
        self.ignore_env = true;
        self
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find ferry.toml. When none exists the
    /// defaults are used.
    pub fn load_from_directory(&self, start_dir: &Path) -> ConfigResult<FerryConfig> {
        let config = match Self::find_config_file(start_dir) {
            Some(path) => FerryConfig::load_from_file(&path)?,
            None => FerryConfig::default(),
        };
        self.finish(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(&self, config_path: &Path) -> ConfigResult<FerryConfig> {
        let config = FerryConfig::load_from_file(config_path)?;
        self.finish(config)
    }

    /// Defaults plus environment overrides
    pub fn load_defaults(&self) -> ConfigResult<FerryConfig> {
        self.finish(FerryConfig::default())
    }

    fn finish(&self, config: FerryConfig) -> ConfigResult<FerryConfig> {
        let config = if self.ignore_env {
            config
        } else {
            Self::apply_env_overrides(config)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Find ferry.toml by walking up the directory tree
    pub fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Some(config_path);
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return None,
            }
        }
    }

    /// Apply environment variable overrides
    ///
    /// - FERRY_ABI=aapcs64
    /// - FERRY_MAX_AGGREGATE=4096
    /// - FERRY_LOG=ferry_runtime=debug
    fn apply_env_overrides(mut config: FerryConfig) -> ConfigResult<FerryConfig> {
        if let Ok(abi) = env::var("FERRY_ABI") {
            config.linker.abi = Some(abi.parse::<AbiName>()?);
        }

        if let Ok(limit) = env::var("FERRY_MAX_AGGREGATE") {
            let parsed = limit.trim().parse::<usize>().map_err(|e| {
                ConfigError::invalid("FERRY_MAX_AGGREGATE", format!("'{}': {}", limit, e))
            })?;
            config.linker.max_by_value_aggregate = parsed;
        }

        if let Ok(filter) = env::var("FERRY_LOG") {
            config.logging.filter = filter;
        }

        Ok(config)
    }
}
