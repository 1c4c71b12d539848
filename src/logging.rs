//! Log output for the `tierstate` binary and embedders that want it.
//!
//! The library only emits `tracing` events; nothing is printed unless a
//! subscriber is installed. Targets:
//!
//! - `tierstate::registry`: instance creation, destruction, shutdown
//! - `tierstate::binding`: thread binding and lookup
//! - `tierstate::lock`: lock-order violations
//! - `tierstate::policy`: declaration validation
//! - `tierstate::codegen`: manifest loading and generation

use tracing::Level;

use crate::config::{ConfigError, LoggingConfig};

/// Install a `fmt` subscriber writing to stderr at `level` and above.
///
/// Returns false if a global subscriber was already installed.
pub fn init(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

/// Install a subscriber at the configured level, raised to `debug` when
/// `verbose` is set.
pub fn init_from_config(config: &LoggingConfig, verbose: bool) -> Result<bool, ConfigError> {
    let level = if verbose {
        Level::DEBUG.max(config.max_level()?)
    } else {
        config.max_level()?
    };
    Ok(init(level))
}
