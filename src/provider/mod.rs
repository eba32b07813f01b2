//! Embedding backends.
//!
//! Two providers implement the same [`EmbeddingProvider`] contract:
//!
//! - [`RemoteProvider`] - calls a hosted OpenAI-compatible embeddings API
//! - [`LocalProvider`] - runs a downloaded CLIP model on-device via Candle
//!
//! Providers are self-contained values constructed fresh on every mode
//! switch and never mutated in place.

mod factory;
mod local;
mod remote;
mod traits;

pub use factory::{DefaultProviderFactory, ProviderFactory};
pub use local::LocalProvider;
pub use remote::RemoteProvider;
pub use traits::{Embedding, EmbeddingProvider, ProviderError, ProviderResult};
