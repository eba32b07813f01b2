//! glimpse - a content-based image retrieval engine
//!
//! This crate provides the embedding/search core for an image retrieval
//! service: pluggable embedding backends (remote API or local on-device
//! models), a persistent embedding cache with staleness detection, device
//! management for local inference, and a model registry with verified
//! downloads.

pub mod cache;
pub mod config;
pub mod corpus;
pub mod device;
pub mod engine;
pub mod provider;
pub mod registry;

pub use engine::SearchEngine;

/// Installs a global tracing subscriber honoring `RUST_LOG`.
///
/// Intended for binaries and test harnesses embedding the engine. Calling
/// it more than once is harmless.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
