//! Tracing subscriber setup for hosts and tests
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! host's call. This helper installs the fmt subscriber writing to stderr.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Install a stderr fmt subscriber
///
/// With `debug`, every event down to `TRACE` is shown; otherwise `RUST_LOG`
/// decides and defaults to `warn`. Fails if a global subscriber is already
/// installed.
pub fn init_tracing(debug: bool) -> Result<()> {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("Failed to install tracing subscriber: {}", err))
}
