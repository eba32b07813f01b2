//! Configuration types.
//!
//! The transport layer owns loading and persisting these settings; the core
//! only defines the types and their defaults.

mod settings;

pub use settings::{
    CacheSettings, ModelEntry, RemoteSettings, RetrySettings, SearchSettings, Settings,
};
