//! Local embedding provider.
//!
//! Runs a downloaded CLIP model on-device via Candle. Weights are loaded
//! into device memory at construction and freed when the provider is
//! dropped (see [`crate::device::DeviceManager::release`]). Inference never
//! mutates shared state; the model sits behind an `Arc` and forward passes
//! run on a blocking thread.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use tokenizers::Tokenizer;

use super::traits::{Embedding, EmbeddingProvider, ProviderError, ProviderResult};
use crate::registry::ModelDescriptor;

/// Token used to pad CLIP text sequences.
const PAD_TOKEN: &str = "<|endoftext|>";

struct ClipInner {
    model: ClipModel,
    tokenizer: Tokenizer,
    config: ClipConfig,
    device: Device,
    model_id: String,
}

/// Provider running a local CLIP model.
pub struct LocalProvider {
    inner: Arc<ClipInner>,
}

impl LocalProvider {
    /// Loads model weights and tokenizer from a downloaded descriptor.
    ///
    /// Fails with [`ProviderError::ModelNotDownloaded`] when the artifacts
    /// are not on disk.
    pub fn load(descriptor: &ModelDescriptor, device: Device) -> ProviderResult<Self> {
        if !descriptor.weight_path.is_file() || !descriptor.tokenizer_path.is_file() {
            return Err(ProviderError::ModelNotDownloaded(descriptor.id.clone()));
        }

        let config = clip_config_for(&descriptor.id)?;

        tracing::info!(model_id = %descriptor.id, "loading local model weights");
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(
                &[descriptor.weight_path.clone()],
                DType::F32,
                &device,
            )?
        };
        let model = ClipModel::new(vb, &config)?;
        let tokenizer = Tokenizer::from_file(&descriptor.tokenizer_path)
            .map_err(|e| ProviderError::Tokenizer(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(ClipInner {
                model,
                tokenizer,
                config,
                device,
                model_id: descriptor.id.clone(),
            }),
        })
    }
}

impl ClipInner {
    fn embed_text_sync(&self, text: &str) -> ProviderResult<Embedding> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| ProviderError::Tokenizer(e.to_string()))?;

        let max_len = self.config.text_config.max_position_embeddings;
        let pad_id = self.tokenizer.token_to_id(PAD_TOKEN).unwrap_or(0);
        let mut tokens = encoding.get_ids().to_vec();
        tokens.truncate(max_len);
        while tokens.len() < max_len {
            tokens.push(pad_id);
        }

        let input_ids = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let features = self.model.get_text_features(&input_ids)?;
        let features = l2_normalize(&features)?;
        Ok(Embedding::new(features.squeeze(0)?.to_vec1::<f32>()?))
    }

    fn embed_image_sync(&self, path: &Path) -> ProviderResult<Embedding> {
        let size = self.config.image_size;
        let img = image::open(path)?
            .resize_to_fill(
                size as u32,
                size as u32,
                image::imageops::FilterType::Triangle,
            )
            .to_rgb8();

        let pixels = Tensor::from_vec(img.into_raw(), (size, size, 3), &Device::Cpu)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(2.0 / 255.0, -1.0)?
            .unsqueeze(0)?
            .to_device(&self.device)?;

        let features = self.model.get_image_features(&pixels)?;
        let features = l2_normalize(&features)?;
        Ok(Embedding::new(features.squeeze(0)?.to_vec1::<f32>()?))
    }
}

/// Divides a feature tensor by its L2 norm along the last dimension.
fn l2_normalize(v: &Tensor) -> candle_core::Result<Tensor> {
    let norm = v.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    v.broadcast_div(&norm)
}

/// Maps a catalog model id to its CLIP architecture config.
fn clip_config_for(model_id: &str) -> ProviderResult<ClipConfig> {
    let lowered = model_id.to_ascii_lowercase();
    if lowered.contains("patch32") || lowered.contains("b-32") {
        Ok(ClipConfig::vit_base_patch32())
    } else {
        Err(ProviderError::InvalidInput(format!(
            "unsupported model architecture: {}",
            model_id
        )))
    }
}

#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn model_id(&self) -> &str {
        &self.inner.model_id
    }

    async fn embed_text(&self, text: &str) -> ProviderResult<Embedding> {
        if text.trim().is_empty() {
            return Err(ProviderError::InvalidInput("empty query".to_string()));
        }
        let inner = self.inner.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || inner.embed_text_sync(&text))
            .await
            .map_err(|e| {
                ProviderError::Inference(candle_core::Error::Msg(format!(
                    "inference task failed: {}",
                    e
                )))
            })?
    }

    async fn embed_image(&self, path: &Path) -> ProviderResult<Embedding> {
        let inner = self.inner.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || inner.embed_image_sync(&path))
            .await
            .map_err(|e| {
                ProviderError::Inference(candle_core::Error::Msg(format!(
                    "inference task failed: {}",
                    e
                )))
            })?
    }
}
