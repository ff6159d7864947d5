//! Logging initialization shared by the daemon binary.
//!
//! Library code never installs a subscriber itself; it only emits
//! `tracing` events. [`init`] is called exactly once, from
//! `thrum-daemon::main`.

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber.
///
/// Honors `RUST_LOG` if set; otherwise defaults to `info`, or `debug` when
/// `verbose` is true.
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
