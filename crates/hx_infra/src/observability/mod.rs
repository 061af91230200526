//! # Observability
//!
//! Tracing setup for the binaries. The core itself never prints; only a
//! launcher calls this.

use tracing_subscriber::EnvFilter;

/// Initialize tracing with an env-filter default.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
