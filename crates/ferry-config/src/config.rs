//! Runtime configuration (ferry.toml)
//!
//! Every section is optional in the file; missing keys fall back to the
//! defaults below.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Default upper bound for aggregates passed or returned by value
pub const DEFAULT_MAX_BY_VALUE_AGGREGATE: usize = 64 * 1024;

/// Default upper bound for allocation alignment
pub const DEFAULT_MAX_ALIGNMENT: usize = 4096;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct FerryConfig {
    /// Linker and call arranging settings
    #[serde(default)]
    pub linker: LinkerConfig,

    /// Arena defaults
    #[serde(default)]
    pub arena: ArenaConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// ABI selectable through configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AbiName {
    /// x86-64 System V
    #[serde(rename = "sysv-x86_64")]
    SysVX86_64,
    /// AArch64 procedure call standard (Linux flavour)
    #[serde(rename = "aapcs64")]
    Aapcs64,
    /// 64-bit PowerPC on AIX
    #[serde(rename = "ppc64-aix")]
    Ppc64Aix,
}

impl AbiName {
    /// Canonical configuration spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            AbiName::SysVX86_64 => "sysv-x86_64",
            AbiName::Aapcs64 => "aapcs64",
            AbiName::Ppc64Aix => "ppc64-aix",
        }
    }
}

impl fmt::Display for AbiName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AbiName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sysv-x86_64" | "sysv" | "x86_64" => Ok(AbiName::SysVX86_64),
            "aapcs64" | "aarch64" => Ok(AbiName::Aapcs64),
            "ppc64-aix" | "ppc64" => Ok(AbiName::Ppc64Aix),
            other => Err(ConfigError::invalid(
                "linker.abi",
                format!("unknown ABI '{}'", other),
            )),
        }
    }
}

/// Scope mode used when the caller does not pick one
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScopeModeName {
    #[default]
    Confined,
    Shared,
    Auto,
}

/// `[linker]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct LinkerConfig {
    /// Force a specific ABI instead of detecting the host
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abi: Option<AbiName>,

    /// Largest aggregate (in bytes) accepted by value
    pub max_by_value_aggregate: usize,

    /// Whether downcalls may re-enter managed code unless told otherwise
    pub allow_upcalls_by_default: bool,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            abi: None,
            max_by_value_aggregate: DEFAULT_MAX_BY_VALUE_AGGREGATE,
            allow_upcalls_by_default: true,
        }
    }
}

/// `[arena]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ArenaConfig {
    /// Largest alignment an allocation may request
    pub max_alignment: usize,

    /// Mode for arenas opened without an explicit mode
    pub default_mode: ScopeModeName,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            max_alignment: DEFAULT_MAX_ALIGNMENT,
            default_mode: ScopeModeName::Confined,
        }
    }
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// tracing filter directive (e.g. "ferry_runtime=debug")
    pub filter: String,

    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "warn".to_string(),
            json: false,
        }
    }
}

impl FerryConfig {
    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate value ranges
    pub fn validate(&self) -> ConfigResult<()> {
        if self.linker.max_by_value_aggregate == 0 {
            return Err(ConfigError::invalid(
                "linker.max_by_value_aggregate",
                "must be greater than zero",
            ));
        }

        let align = self.arena.max_alignment;
        if align == 0 || !align.is_power_of_two() {
            return Err(ConfigError::invalid(
                "arena.max_alignment",
                format!("{} is not a power of two", align),
            ));
        }

        if self.logging.filter.trim().is_empty() {
            return Err(ConfigError::invalid("logging.filter", "must not be empty"));
        }

        Ok(())
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid("config", format!("serialization failed: {}", e)))
    }
}
