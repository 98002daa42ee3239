//! # Logging Initialization
//!
//! All diagnostics go to `stderr`. In relay mode `stdout` carries JSON-RPC
//! frames for the local peer, so nothing else may ever be written there.
//!
//! Verbosity follows `RUST_LOG`; without it every target, the gateway crates
//! included, logs at `--log-level` (`info` by default). Lines the backing
//! process writes to its stderr are logged under the `child_stderr` target, so
//! `RUST_LOG=child_stderr=off` silences them.

use std::io::{IsTerminal, stderr};
use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt::layer, prelude::*};

static INIT: Once = Once::new();

/// Install the global tracing subscriber. Safe to call more than once.
pub fn init_logging(log_level: &str) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| default_filter(log_level));

        // Another subscriber may already be installed (e.g. by a test harness)
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(
                layer()
                    .with_writer(stderr)
                    .with_ansi(stderr().is_terminal()),
            )
            .try_init();
    });
}

/// Filter used when `RUST_LOG` is unset.
fn default_filter(log_level: &str) -> EnvFilter {
    EnvFilter::new(log_level)
}

pub fn init_test_logging() {
    init_logging("warn");
}
