//! Logging setup
//!
//! The runtime logs through `tracing` and never installs a subscriber on its
//! own. Applications that want output call [`init`] once, early; the filter
//! comes from the `[logging]` section of `ferry.toml`, which `FERRY_LOG`
//! overrides.

use ferry_config::LoggingConfig;
use tracing_subscriber::{fmt, EnvFilter};

const FALLBACK_FILTER: &str = "warn";

/// Install a global fmt subscriber
///
/// Returns false when a subscriber was already installed.
pub fn init(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|e| {
        eprintln!(
            "ferry: invalid log filter '{}' ({}), using '{}'",
            config.filter, e, FALLBACK_FILTER
        );
        EnvFilter::new(FALLBACK_FILTER)
    });

    let builder = fmt().with_env_filter(filter).with_target(true);
    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    installed.is_ok()
}
