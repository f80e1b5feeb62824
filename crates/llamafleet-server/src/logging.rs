//! Installs the process-wide `tracing` subscriber.

use tracing_subscriber::EnvFilter;

/// Initializes structured logging. `default_directive` is the fallback filter used
/// when `RUST_LOG` is unset, typically `config.log_level`.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
