//! Logging setup.
//!
//! Thin wrapper over `tracing-subscriber`: call [`init_logging`] once from
//! the embedding application. Verbosity follows `RUST_LOG`, defaulting to
//! `info` globally and `debug` for this crate.

use std::sync::Once;

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static INIT: Once = Once::new();

/// Initialize the global subscriber (stderr). Safe to call repeatedly.
pub fn init_logging() {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,uxec=debug"));
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}

/// Test-friendly init: captures output per test and tolerates being called
/// from many tests at once.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
