//! Model registry: static catalog of local models and verified downloads.
//!
//! The registry knows which models exist, where their weight artifacts live
//! on disk, and whether those artifacts are present and intact. Downloads
//! are idempotent, checksum-verified, and single-flight per model id.

mod catalog;
mod download;

pub use catalog::{ModelDescriptor, ModelRegistry, ModelSummary, PerformanceTier, RegistryError};
