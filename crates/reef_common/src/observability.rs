//! Opt-in structured logging setup for binaries and integration tests.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is the embedding application's call.

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
///
/// Honors `RUST_LOG`; defaults to `info` overall and `debug` for the
/// client crates.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,reef=debug"));

    let fmt_layer = fmt::layer().with_target(true);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}
