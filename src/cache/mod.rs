//! Embedding cache lifecycle.
//!
//! Maps image identity to embedding vectors with fingerprint-based
//! staleness detection:
//!
//! - [`CacheStore`] - durable SQLite-backed entry storage
//! - [`GenerationJob`] - single-flight background generation state
//! - [`EmbeddingCache`] - build, incremental update, and similarity query

mod job;
mod store;

pub use job::{GenerationJob, GenerationReport, GenerationStatus};
pub use store::{CacheEntry, CacheError, CacheStore, Result};

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::corpus::{fingerprint, Corpus};
use crate::provider::{Embedding, EmbeddingProvider};

/// Persisted image-to-embedding mapping with incremental regeneration.
pub struct EmbeddingCache {
    store: CacheStore,
    job: GenerationJob,
}

impl EmbeddingCache {
    /// Opens the cache database at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            store: CacheStore::open(path).await?,
            job: GenerationJob::new(),
        })
    }

    /// Opens an in-memory cache for testing.
    pub async fn open_in_memory() -> Result<Self> {
        Ok(Self {
            store: CacheStore::open_in_memory().await?,
            job: GenerationJob::new(),
        })
    }

    /// Access to the underlying store.
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// The background generation job.
    pub fn job(&self) -> &GenerationJob {
        &self.job
    }

    /// True iff at least one entry is fresh for the current corpus
    /// snapshot (its fingerprint matches the image's current content).
    pub async fn has_cache(&self, corpus: &dyn Corpus) -> Result<bool> {
        let stored = self.store.fingerprints().await?;
        if stored.is_empty() {
            return Ok(false);
        }
        for item in corpus.items()? {
            if let Some(cached) = stored.get(&item.id) {
                if fingerprint(&item.path)? == *cached {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Builds or incrementally updates the cache for the corpus.
    ///
    /// Images whose stored fingerprint matches their current content are
    /// skipped; the rest are embedded through `provider` and upserted.
    /// Single-flight process-wide: a concurrent call fails with
    /// [`CacheError::Busy`]. Cancellation is checked between items; a
    /// cancelled pass keeps every entry written so far (each is complete
    /// and fingerprint-consistent) and reports `Failed`.
    pub async fn generate(
        &self,
        provider: Arc<dyn EmbeddingProvider>,
        corpus: &dyn Corpus,
        prune_removed: bool,
    ) -> Result<GenerationReport> {
        if !self.job.try_begin() {
            return Err(CacheError::Busy);
        }
        self.run_claimed(provider, corpus, prune_removed).await
    }

    /// Runs a generation pass for a caller that already claimed the job
    /// via [`GenerationJob::try_begin`].
    pub(crate) async fn run_claimed(
        &self,
        provider: Arc<dyn EmbeddingProvider>,
        corpus: &dyn Corpus,
        prune_removed: bool,
    ) -> Result<GenerationReport> {
        let cancel = self.job.cancel_token();

        let result = self
            .generate_inner(provider, corpus, prune_removed, &cancel)
            .await;

        match &result {
            Ok(report) => {
                tracing::info!(
                    embedded = report.embedded,
                    skipped = report.skipped,
                    pruned = report.pruned,
                    "cache generation complete"
                );
                self.job.finish(Ok(()));
            }
            Err(error) => {
                tracing::warn!(%error, "cache generation failed");
                self.job.finish(Err(error.to_string()));
            }
        }
        result
    }

    async fn generate_inner(
        &self,
        provider: Arc<dyn EmbeddingProvider>,
        corpus: &dyn Corpus,
        prune_removed: bool,
        cancel: &CancellationToken,
    ) -> Result<GenerationReport> {
        let items = corpus.items()?;
        let existing = self.store.fingerprints().await?;
        let mut report = GenerationReport::default();

        for item in &items {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            let current = fingerprint(&item.path)?;
            if existing.get(&item.id) == Some(&current) {
                self.job.count_skipped();
                report.skipped += 1;
                continue;
            }

            tracing::debug!(image_id = %item.id, "embedding image");
            let embedding = provider.embed_image(&item.path).await?;
            self.store
                .upsert(CacheEntry {
                    image_id: item.id.clone(),
                    embedding,
                    fingerprint: current,
                    model_id: provider.model_id().to_string(),
                    updated_at: Utc::now(),
                })
                .await?;
            self.job.count_embedded();
            report.embedded += 1;
        }

        if prune_removed {
            let live: HashSet<&String> = items.iter().map(|item| &item.id).collect();
            for stale_id in existing.keys().filter(|id| !live.contains(id)) {
                self.store.remove(stale_id).await?;
                report.pruned += 1;
            }
        }

        Ok(report)
    }

    /// Ranks every cached entry against `vector` by cosine similarity.
    ///
    /// Returns the top `k` as (image id, score), scores descending, ties
    /// broken by ascending image id.
    pub async fn query(&self, vector: &Embedding, k: usize) -> Result<Vec<(String, f32)>> {
        let entries = self.store.all().await?;

        let mut scores: Vec<(String, f32)> = entries
            .into_iter()
            .map(|entry| {
                let score = vector.cosine_similarity(&entry.embedding);
                (entry.image_id, score)
            })
            .collect();

        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        scores.truncate(k);
        Ok(scores)
    }
}
