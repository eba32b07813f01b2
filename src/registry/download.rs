//! Streaming, checksum-verified model downloads.
//!
//! Artifacts stream into a `.part` file, hashing as bytes arrive; only a
//! verified artifact is renamed into place, so a crash, cancellation, or
//! integrity failure never leaves a model marked as downloaded.

use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use ring::digest::{Context, SHA256};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::catalog::{artifact_matches, ModelRegistry, RegistryError, Result};
use crate::corpus::hex_encode;

impl ModelRegistry {
    /// Downloads a model's artifacts.
    ///
    /// Idempotent: returns Ok immediately when the model is already
    /// downloaded and verified. Concurrent calls for the same id are
    /// serialized; the second caller observes the first one's result via
    /// the idempotence check. Distinct ids download independently.
    pub async fn download(&self, model_id: &str, cancel: &CancellationToken) -> Result<()> {
        let descriptor = self.get(model_id)?.clone();

        let lock = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(model_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        if self.is_downloaded(model_id) {
            tracing::debug!(model_id, "model already downloaded, skipping");
            return Ok(());
        }

        if let Some(parent) = descriptor.weight_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tracing::info!(model_id, url = %descriptor.weight_url, "downloading model weights");
        self.fetch_artifact(
            &descriptor.id,
            &descriptor.weight_url,
            &descriptor.weight_path,
            descriptor.sha256.as_deref(),
            cancel,
        )
        .await?;

        tracing::info!(model_id, url = %descriptor.tokenizer_url, "downloading tokenizer");
        self.fetch_artifact(
            &descriptor.id,
            &descriptor.tokenizer_url,
            &descriptor.tokenizer_path,
            descriptor.tokenizer_sha256.as_deref(),
            cancel,
        )
        .await?;

        self.mark_verified(model_id);
        tracing::info!(model_id, "model download complete");
        Ok(())
    }

    /// Streams one artifact to disk with verification.
    async fn fetch_artifact(
        &self,
        model_id: &str,
        url: &str,
        dest: &Path,
        expected_sha256: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // An individual artifact may survive from an earlier partial run.
        if artifact_matches(dest, expected_sha256) {
            return Ok(());
        }

        let part = dest.with_extension("part");
        let response = self.client.get(url).send().await?.error_for_status()?;

        let mut file = tokio::fs::File::create(&part).await?;
        let mut hasher = Context::new(&SHA256);
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                drop(file);
                let _ = tokio::fs::remove_file(&part).await;
                tracing::warn!(model_id, "download cancelled, partial artifact removed");
                return Err(RegistryError::Cancelled(model_id.to_string()));
            }
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&part).await;
                    return Err(error.into());
                }
            };
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        drop(file);

        if let Some(expected) = expected_sha256 {
            let actual = hex_encode(hasher.finish().as_ref());
            if !actual.eq_ignore_ascii_case(expected) {
                let _ = tokio::fs::remove_file(&part).await;
                tracing::warn!(model_id, expected, actual, "artifact checksum mismatch");
                return Err(RegistryError::DownloadIntegrity {
                    model_id: model_id.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        tokio::fs::rename(&part, dest).await?;
        Ok(())
    }
}
