//! Logging prelude module for convenient access to tracing macros.
//!
//! Re-exports the common `tracing` macros so the rest of the crate can write
//! `use crate::logging::*;` once instead of depending on `tracing` directly
//! everywhere.

pub use tracing::{debug, error, info, trace, warn};

/// Initialize the global tracing subscriber.
///
/// Logs at INFO and above by default. Override with `RUST_LOG`:
///
/// ```bash
/// RUST_LOG=debug dlan-node
/// RUST_LOG=dlan::download=trace,dlan::protocol=debug dlan-node
/// ```
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}
