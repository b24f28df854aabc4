mod error;
pub use error::*;

pub mod api;
pub mod client;
pub mod config;
pub mod crypto;
pub mod database;
pub mod models;
pub mod sync;
mod time_utils;

/// Installs the `tracing` subscriber shared by the binaries. `RUST_LOG`
/// overrides the default `info` level.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
