//! Provider construction.
//!
//! The engine builds providers through this trait so mode-switching logic
//! can be exercised in tests without network access or model weights.

use std::sync::Arc;

use candle_core::Device;

use super::local::LocalProvider;
use super::remote::RemoteProvider;
use super::traits::{EmbeddingProvider, ProviderResult};
use crate::config::{RemoteSettings, RetrySettings};
use crate::registry::ModelDescriptor;

/// Constructs embedding providers.
pub trait ProviderFactory: Send + Sync {
    /// Builds a remote provider. A per-call key override takes precedence
    /// over the configured credential.
    fn remote(
        &self,
        settings: &RemoteSettings,
        retry: &RetrySettings,
        api_key_override: Option<&str>,
    ) -> ProviderResult<Arc<dyn EmbeddingProvider>>;

    /// Builds a local provider, loading weights onto the given device.
    fn local(
        &self,
        descriptor: &ModelDescriptor,
        device: Device,
    ) -> ProviderResult<Arc<dyn EmbeddingProvider>>;
}

/// Production factory backed by [`RemoteProvider`] and [`LocalProvider`].
#[derive(Debug, Default)]
pub struct DefaultProviderFactory;

impl ProviderFactory for DefaultProviderFactory {
    fn remote(
        &self,
        settings: &RemoteSettings,
        retry: &RetrySettings,
        api_key_override: Option<&str>,
    ) -> ProviderResult<Arc<dyn EmbeddingProvider>> {
        let api_key = api_key_override.unwrap_or(&settings.api_key);
        let provider = RemoteProvider::new(
            api_key,
            &settings.base_url,
            &settings.model,
            retry.clone(),
        )?;
        Ok(Arc::new(provider))
    }

    fn local(
        &self,
        descriptor: &ModelDescriptor,
        device: Device,
    ) -> ProviderResult<Arc<dyn EmbeddingProvider>> {
        Ok(Arc::new(LocalProvider::load(descriptor, device)?))
    }
}
