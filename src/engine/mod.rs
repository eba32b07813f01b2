//! The search engine: query orchestration and mode switching.
//!
//! [`SearchEngine`] owns the active embedding provider and mediates every
//! operation the transport layer exposes. Mode/provider state lives behind
//! a `RwLock`: searches take a non-blocking read claim and fail with
//! [`EngineError::Busy`] while a switch holds the write side, so a caller
//! never observes a half-switched provider.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheError, EmbeddingCache, GenerationStatus};
use crate::config::Settings;
use crate::corpus::{Corpus, CorpusError};
use crate::device::{DeviceManager, DevicePreference};
use crate::provider::{
    DefaultProviderFactory, Embedding, EmbeddingProvider, ProviderError, ProviderFactory,
};
use crate::registry::{ModelRegistry, ModelSummary, RegistryError};

/// Errors surfaced by engine operations.
///
/// Registry/provider/cache kinds pass through losslessly so the boundary
/// layer can map "needs download" vs "not found" vs "retry later" to
/// distinct status signals.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine busy: {0}")]
    Busy(&'static str),

    #[error("invalid mode: {0}")]
    InvalidMode(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Corpus(#[from] CorpusError),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Which embedding backend is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Mode {
    /// Hosted embedding API.
    Remote,
    /// On-device model.
    Local {
        /// The active local model.
        model_id: String,
    },
}

/// Mode requested by a caller, before validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeKind {
    Remote,
    Local,
}

/// One ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    /// Image identifier within the corpus.
    pub image_id: String,
    /// Cosine similarity against the query embedding.
    pub score: f32,
    /// 1-based position in the result list.
    pub rank: usize,
}

/// Mode/provider state guarded by the engine's lock.
struct EngineState {
    mode: Mode,
    provider: Arc<dyn EmbeddingProvider>,
    devices: DeviceManager,
}

/// Orchestrates query embedding, cache ranking, and backend switching.
pub struct SearchEngine {
    settings: Settings,
    registry: Arc<ModelRegistry>,
    cache: Arc<EmbeddingCache>,
    corpus: Arc<dyn Corpus>,
    factory: Arc<dyn ProviderFactory>,
    state: RwLock<EngineState>,
    /// Memo of query embeddings keyed by provider/model/query text.
    query_memo: Mutex<LruCache<String, Embedding>>,
}

impl SearchEngine {
    /// Creates an engine with production components, starting in remote
    /// mode.
    pub async fn new(settings: Settings, corpus: Arc<dyn Corpus>) -> Result<Self> {
        let registry = Arc::new(ModelRegistry::new(&settings.models, &settings.models_dir));
        let cache = Arc::new(EmbeddingCache::open(&settings.cache.db_path).await?);
        Self::with_components(
            settings,
            corpus,
            registry,
            cache,
            Arc::new(DefaultProviderFactory),
        )
    }

    /// Creates an engine from explicit components.
    ///
    /// Lets callers substitute the provider factory (alternate backends,
    /// tests) or share a registry/cache with other subsystems.
    pub fn with_components(
        settings: Settings,
        corpus: Arc<dyn Corpus>,
        registry: Arc<ModelRegistry>,
        cache: Arc<EmbeddingCache>,
        factory: Arc<dyn ProviderFactory>,
    ) -> Result<Self> {
        let provider = factory.remote(&settings.remote, &settings.retry, None)?;
        let memo_size = NonZeroUsize::new(settings.search.query_memo_size.max(1))
            .expect("memo size is at least 1");

        Ok(Self {
            settings,
            registry,
            cache,
            corpus,
            factory,
            state: RwLock::new(EngineState {
                mode: Mode::Remote,
                provider,
                devices: DeviceManager::new(),
            }),
            query_memo: Mutex::new(LruCache::new(memo_size)),
        })
    }

    /// Searches the cached corpus for the `k` images most similar to the
    /// text query.
    ///
    /// `api_key` overrides the configured remote credential for this call
    /// only; it is ignored in local mode. Fails with [`EngineError::Busy`]
    /// while a mode switch is in progress.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        api_key: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        let state = self
            .state
            .try_read()
            .map_err(|_| EngineError::Busy("mode switch in progress"))?;

        let provider: Arc<dyn EmbeddingProvider> = match (&state.mode, api_key) {
            (Mode::Remote, Some(key)) => {
                self.factory
                    .remote(&self.settings.remote, &self.settings.retry, Some(key))?
            }
            _ => state.provider.clone(),
        };

        let embedding = self.embed_query(provider.as_ref(), query).await?;
        let hits = self.cache.query(&embedding, k).await?;

        Ok(hits
            .into_iter()
            .enumerate()
            .map(|(i, (image_id, score))| SearchResult {
                image_id,
                score,
                rank: i + 1,
            })
            .collect())
    }

    async fn embed_query(
        &self,
        provider: &dyn EmbeddingProvider,
        query: &str,
    ) -> Result<Embedding> {
        let key = format!("{}:{}:{}", provider.name(), provider.model_id(), query);

        if let Some(hit) = self
            .query_memo
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
        {
            return Ok(hit);
        }

        let embedding = provider.embed_text(query).await?;
        self.query_memo
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(key, embedding.clone());
        Ok(embedding)
    }

    /// The currently active mode.
    pub async fn get_mode(&self) -> Mode {
        self.state.read().await.mode.clone()
    }

    /// Switches the active embedding backend.
    ///
    /// Atomic: on success the new mode is active; on failure the engine is
    /// left in a consistent prior (or documented fallback) state, never
    /// half-switched. Rejected while cache generation is running, since
    /// generation pins the provider it started with.
    pub async fn set_mode(&self, mode: ModeKind, model_id: Option<&str>) -> Result<()> {
        match (mode, model_id) {
            (ModeKind::Remote, Some(_)) => Err(EngineError::InvalidMode(
                "a model id only applies to local mode".to_string(),
            )),
            (ModeKind::Local, None) => Err(EngineError::InvalidMode(
                "local mode requires a model id".to_string(),
            )),
            (ModeKind::Remote, None) => self.switch_remote().await,
            (ModeKind::Local, Some(id)) => self.switch_local(id).await,
        }
    }

    async fn switch_remote(&self) -> Result<()> {
        let mut state = self.state.write().await;
        // Checked under the lock: generation claims the job while holding
        // the read side, so a claim can never slip in past this point.
        if self.cache.job().is_running() {
            return Err(EngineError::Busy("cache generation in progress"));
        }
        if state.mode == Mode::Remote {
            return Ok(());
        }

        // Build the successor before tearing anything down; a failure here
        // leaves the current state untouched.
        let provider = self
            .factory
            .remote(&self.settings.remote, &self.settings.retry, None)?;

        let old = std::mem::replace(&mut state.provider, provider);
        state.devices.release(old);
        state.mode = Mode::Remote;
        tracing::info!("switched to remote mode");
        Ok(())
    }

    async fn switch_local(&self, model_id: &str) -> Result<()> {
        // Validate preconditions before touching engine state.
        let descriptor = self.registry.get(model_id)?.clone();
        if !self.registry.is_downloaded(model_id) {
            return Err(RegistryError::ModelNotDownloaded(model_id.to_string()).into());
        }

        let mut state = self.state.write().await;
        if self.cache.job().is_running() {
            return Err(EngineError::Busy("cache generation in progress"));
        }
        let prior_mode = state.mode.clone();

        // Only one local provider may occupy the device at a time, so a
        // prior local provider is released before the new one loads. A
        // remote placeholder keeps the state consistent on every exit path.
        if matches!(prior_mode, Mode::Local { .. }) {
            let placeholder = self
                .factory
                .remote(&self.settings.remote, &self.settings.retry, None)?;
            let old = std::mem::replace(&mut state.provider, placeholder);
            state.devices.release(old);
            state.mode = Mode::Remote;
        }

        let device = state.devices.acquire(DevicePreference::Auto);
        match self.factory.local(&descriptor, device) {
            Ok(provider) => {
                state.provider = provider;
                state.mode = Mode::Local {
                    model_id: model_id.to_string(),
                };
                tracing::info!(model_id, "switched to local mode");
                Ok(())
            }
            Err(error) => {
                state.devices.release(());
                if let Mode::Local {
                    model_id: prior_id,
                } = &prior_mode
                {
                    // The prior model's weights are still on disk; try to
                    // restore it, falling back to remote if that fails too.
                    let device = state.devices.acquire(DevicePreference::Auto);
                    match self
                        .registry
                        .get(prior_id)
                        .map_err(EngineError::from)
                        .and_then(|desc| {
                            self.factory.local(desc, device).map_err(EngineError::from)
                        }) {
                        Ok(provider) => {
                            state.provider = provider;
                            state.mode = prior_mode.clone();
                        }
                        Err(restore_error) => {
                            state.devices.release(());
                            tracing::warn!(
                                prior_model = %prior_id,
                                error = %restore_error,
                                "could not restore prior local model, staying in remote mode"
                            );
                        }
                    }
                }
                Err(error.into())
            }
        }
    }

    /// True iff at least one cache entry is fresh for the current corpus.
    pub async fn has_cache(&self) -> Result<bool> {
        Ok(self.cache.has_cache(self.corpus.as_ref()).await?)
    }

    /// Starts cache generation as a background job.
    ///
    /// Fire-and-forget: poll [`SearchEngine::generation_status`] for the
    /// outcome. Fails with [`EngineError::Busy`] when a pass is already
    /// running (single-flight, never queued).
    pub fn generate_cache(self: &Arc<Self>) -> Result<()> {
        // The job is claimed while the state read guard is held; the
        // switch paths re-check the claim under the write lock, so the
        // claim and the provider snapshot are always consistent with the
        // mode a caller observes.
        let state = self
            .state
            .try_read()
            .map_err(|_| EngineError::Busy("mode switch in progress"))?;
        if !self.cache.job().try_begin() {
            return Err(EngineError::Busy("cache generation in progress"));
        }
        let provider = state.provider.clone();
        drop(state);

        let engine = self.clone();
        let prune = self.settings.cache.prune_removed;
        tokio::spawn(async move {
            // Status and counters are recorded on the job; the task result
            // itself is observed through polling.
            let _ = engine
                .cache
                .run_claimed(provider, engine.corpus.as_ref(), prune)
                .await;
        });
        Ok(())
    }

    /// Observable status of the generation job.
    pub fn generation_status(&self) -> GenerationStatus {
        self.cache.job().status()
    }

    /// Requests cooperative cancellation of a running generation pass.
    pub fn cancel_generation(&self) {
        self.cache.job().request_cancel();
    }

    /// Catalog rows with their download state.
    pub fn list_models(&self) -> Vec<ModelSummary> {
        self.registry.summaries()
    }

    /// Whether a model's artifacts are on disk and verified.
    pub fn is_model_downloaded(&self, model_id: &str) -> bool {
        self.registry.is_downloaded(model_id)
    }

    /// Downloads a model's artifacts (blocking; idempotent per model id).
    pub async fn download_model(&self, model_id: &str) -> Result<()> {
        Ok(self
            .registry
            .download(model_id, &CancellationToken::new())
            .await?)
    }

    /// The registry backing this engine.
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// The cache backing this engine.
    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }
}
