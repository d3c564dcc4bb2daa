//! Logging setup
//!
//! Library code only emits `tracing` events. Applications and tests call
//! [`init`] (or [`init_from_config`]) once to print them to stderr.

use epa_config::Config;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directives
pub const LOG_ENV: &str = "EPA_LOG";

const DEFAULT_FILTER: &str = "warn";

/// Install a stderr subscriber
///
/// `EPA_LOG` wins over `default_filter`. Returns `false` when a global
/// subscriber was already set.
pub fn init(default_filter: Option<&str>) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(default_filter.unwrap_or(DEFAULT_FILTER)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Install a subscriber using the `[logging]` filter of `config`
pub fn init_from_config(config: &Config) -> bool {
    init(config.log_filter())
}
