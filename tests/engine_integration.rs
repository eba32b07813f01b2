//! End-to-end tests for the search engine.
//!
//! These tests exercise the full pipeline — corpus enumeration, cache
//! generation, query embedding, ranking, and mode switching — through the
//! engine's public surface. A stub provider factory supplies deterministic
//! embeddings so no network access or model weights are needed; provider
//! and registry internals are covered by their own unit tests.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use candle_core::Device;
use tempfile::TempDir;

use glimpse::cache::{EmbeddingCache, GenerationStatus};
use glimpse::config::{ModelEntry, RemoteSettings, RetrySettings, Settings};
use glimpse::corpus::DirectoryCorpus;
use glimpse::engine::{EngineError, Mode, ModeKind, SearchEngine};
use glimpse::provider::{
    Embedding, EmbeddingProvider, ProviderError, ProviderFactory, ProviderResult,
};
use glimpse::registry::{ModelDescriptor, ModelRegistry, PerformanceTier, RegistryError};

// ============================================================================
// Stub providers
// ============================================================================

/// Embeds by fixed lookup table: image files by name, text queries by the
/// query string. Unknown inputs get a zero vector.
struct TableProvider {
    name: &'static str,
    model: String,
    table: Vec<(String, Vec<f32>)>,
}

impl TableProvider {
    fn lookup(&self, key: &str) -> Embedding {
        let values = self
            .table
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| vec![0.0, 0.0]);
        Embedding::new(values)
    }
}

#[async_trait]
impl EmbeddingProvider for TableProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed_text(&self, text: &str) -> ProviderResult<Embedding> {
        Ok(self.lookup(text))
    }

    async fn embed_image(&self, path: &Path) -> ProviderResult<Embedding> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ProviderError::InvalidInput("bad path".to_string()))?;
        Ok(self.lookup(name))
    }
}

/// Factory handing out table-driven stubs for both modes.
struct TableFactory {
    table: Vec<(String, Vec<f32>)>,
}

impl TableFactory {
    fn known_corpus() -> Self {
        Self {
            table: vec![
                ("first.png".to_string(), vec![1.0, 0.0]),
                ("second.png".to_string(), vec![0.0, 1.0]),
                ("third.png".to_string(), vec![0.7, 0.7]),
                ("east".to_string(), vec![1.0, 0.0]),
                ("north".to_string(), vec![0.0, 1.0]),
            ],
        }
    }
}

impl ProviderFactory for TableFactory {
    fn remote(
        &self,
        settings: &RemoteSettings,
        _retry: &RetrySettings,
        _api_key_override: Option<&str>,
    ) -> ProviderResult<Arc<dyn EmbeddingProvider>> {
        Ok(Arc::new(TableProvider {
            name: "remote",
            model: settings.model.clone(),
            table: self.table.clone(),
        }))
    }

    fn local(
        &self,
        descriptor: &ModelDescriptor,
        _device: Device,
    ) -> ProviderResult<Arc<dyn EmbeddingProvider>> {
        Ok(Arc::new(TableProvider {
            name: "local",
            model: descriptor.id.clone(),
            table: self.table.clone(),
        }))
    }
}

/// Delegates to a table factory, but parks local construction until the
/// gate channel fires. Lets a test observe the engine mid-switch.
struct GatedFactory {
    inner: TableFactory,
    gate: std::sync::Mutex<Option<std::sync::mpsc::Receiver<()>>>,
}

impl GatedFactory {
    fn new(inner: TableFactory, gate: std::sync::mpsc::Receiver<()>) -> Self {
        Self {
            inner,
            gate: std::sync::Mutex::new(Some(gate)),
        }
    }
}

impl ProviderFactory for GatedFactory {
    fn remote(
        &self,
        settings: &RemoteSettings,
        retry: &RetrySettings,
        api_key_override: Option<&str>,
    ) -> ProviderResult<Arc<dyn EmbeddingProvider>> {
        self.inner.remote(settings, retry, api_key_override)
    }

    fn local(
        &self,
        descriptor: &ModelDescriptor,
        device: Device,
    ) -> ProviderResult<Arc<dyn EmbeddingProvider>> {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            let _ = gate.recv();
        }
        self.inner.local(descriptor, device)
    }
}

// ============================================================================
// Fixture
// ============================================================================

async fn engine_with_corpus<F>(factory: F) -> (Arc<SearchEngine>, TempDir)
where
    F: ProviderFactory + 'static,
{
    glimpse::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let corpus_dir = dir.path().join("images");
    std::fs::create_dir_all(&corpus_dir).unwrap();
    std::fs::write(corpus_dir.join("first.png"), b"image one").unwrap();
    std::fs::write(corpus_dir.join("second.png"), b"image two").unwrap();
    std::fs::write(corpus_dir.join("third.png"), b"image three").unwrap();

    let mut settings = Settings::default();
    settings.cache.corpus_dir = corpus_dir.clone();
    settings.models_dir = dir.path().join("models");
    settings.models = vec![ModelEntry {
        id: "clip-test".to_string(),
        tier: PerformanceTier::Fast,
        dimension: 2,
        weight_url: "http://127.0.0.1:1/model.safetensors".to_string(),
        tokenizer_url: "http://127.0.0.1:1/tokenizer.json".to_string(),
        sha256: None,
        tokenizer_sha256: None,
    }];

    let registry = Arc::new(ModelRegistry::new(&settings.models, &settings.models_dir));
    let cache = Arc::new(EmbeddingCache::open_in_memory().await.unwrap());
    let corpus = Arc::new(DirectoryCorpus::new(corpus_dir));

    let engine =
        SearchEngine::with_components(settings, corpus, registry, cache, Arc::new(factory))
            .unwrap();
    (Arc::new(engine), dir)
}

fn mark_downloaded(engine: &SearchEngine, model_id: &str) {
    let descriptor = engine.registry().get(model_id).unwrap();
    std::fs::create_dir_all(descriptor.weight_path.parent().unwrap()).unwrap();
    std::fs::write(&descriptor.weight_path, b"weights").unwrap();
    std::fs::write(&descriptor.tokenizer_path, b"tokenizer").unwrap();
}

async fn wait_for_generation(engine: &SearchEngine) {
    for _ in 0..200 {
        match engine.generation_status() {
            GenerationStatus::Done | GenerationStatus::Failed(_) => return,
            _ => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    panic!("generation did not finish");
}

// ============================================================================
// Search pipeline
// ============================================================================

#[tokio::test]
async fn known_embeddings_rank_as_expected() -> anyhow::Result<()> {
    let (engine, _dir) = engine_with_corpus(TableFactory::known_corpus()).await;

    engine.generate_cache()?;
    wait_for_generation(&engine).await;
    assert_eq!(engine.generation_status(), GenerationStatus::Done);
    assert!(engine.has_cache().await?);

    // Corpus embeddings [1,0], [0,1], [0.7,0.7]; query [1,0], k=2.
    let results = engine.search("east", 2, None).await?;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].image_id, "first.png");
    assert!((results[0].score - 1.0).abs() < 0.0001);
    assert_eq!(results[0].rank, 1);
    assert_eq!(results[1].image_id, "third.png");
    assert!((results[1].score - 0.7071).abs() < 0.001);
    assert_eq!(results[1].rank, 2);
    Ok(())
}

#[tokio::test]
async fn search_is_deterministic() {
    let (engine, _dir) = engine_with_corpus(TableFactory::known_corpus()).await;
    engine.generate_cache().unwrap();
    wait_for_generation(&engine).await;

    let first = engine.search("east", 3, None).await.unwrap();
    let second = engine.search("east", 3, None).await.unwrap();
    let third = engine.search("east", 3, None).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(second, third);
}

#[tokio::test]
async fn scores_are_non_increasing() {
    let (engine, _dir) = engine_with_corpus(TableFactory::known_corpus()).await;
    engine.generate_cache().unwrap();
    wait_for_generation(&engine).await;

    let results = engine.search("east", 10, None).await.unwrap();
    for pair in results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[tokio::test]
async fn search_without_cache_returns_empty() {
    let (engine, _dir) = engine_with_corpus(TableFactory::known_corpus()).await;
    assert!(!engine.has_cache().await.unwrap());

    let results = engine.search("east", 5, None).await.unwrap();
    assert!(results.is_empty());
}

// ============================================================================
// Cache generation job
// ============================================================================

#[tokio::test]
async fn regeneration_skips_unchanged_corpus() {
    let (engine, _dir) = engine_with_corpus(TableFactory::known_corpus()).await;

    engine.generate_cache().unwrap();
    wait_for_generation(&engine).await;
    assert_eq!(engine.cache().job().progress(), (3, 0));

    engine.generate_cache().unwrap();
    wait_for_generation(&engine).await;
    // Zero embedding calls the second time: every fingerprint matched.
    assert_eq!(engine.cache().job().progress(), (0, 3));
}

#[tokio::test]
async fn generation_is_single_flight() {
    let (engine, _dir) = engine_with_corpus(TableFactory::known_corpus()).await;

    assert!(engine.cache().job().try_begin());
    let err = engine.generate_cache().unwrap_err();
    assert!(matches!(err, EngineError::Busy(_)));
    engine.cache().job().finish(Ok(()));

    // After the first pass finishes, a new one may start.
    engine.generate_cache().unwrap();
    wait_for_generation(&engine).await;
}

// ============================================================================
// Mode switching
// ============================================================================

#[tokio::test]
async fn mode_switch_round_trip_preserves_results() -> anyhow::Result<()> {
    let (engine, _dir) = engine_with_corpus(TableFactory::known_corpus()).await;
    mark_downloaded(&engine, "clip-test");

    engine.generate_cache()?;
    wait_for_generation(&engine).await;

    engine.set_mode(ModeKind::Local, Some("clip-test")).await?;
    let local_before = engine.search("east", 3, None).await?;

    engine.set_mode(ModeKind::Remote, None).await?;
    engine.set_mode(ModeKind::Local, Some("clip-test")).await?;
    let local_after = engine.search("east", 3, None).await?;

    assert_eq!(local_before, local_after);
    assert_eq!(
        engine.get_mode().await,
        Mode::Local {
            model_id: "clip-test".to_string()
        }
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn search_is_busy_while_switch_holds_the_state_lock() {
    let (tx, rx) = std::sync::mpsc::channel();
    let (engine, _dir) =
        engine_with_corpus(GatedFactory::new(TableFactory::known_corpus(), rx)).await;
    mark_downloaded(&engine, "clip-test");

    engine.generate_cache().unwrap();
    wait_for_generation(&engine).await;

    // The switch parks inside the gated factory while holding the engine's
    // state lock.
    let switching = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.set_mode(ModeKind::Local, Some("clip-test")).await })
    };

    let mut saw_busy = false;
    for _ in 0..200 {
        match engine.search("east", 1, None).await {
            Err(EngineError::Busy(_)) => {
                saw_busy = true;
                break;
            }
            // The spawned switch may not have taken the lock yet.
            Ok(_) => tokio::time::sleep(Duration::from_millis(5)).await,
            Err(other) => panic!("unexpected error during switch: {other}"),
        }
    }
    assert!(saw_busy);

    tx.send(()).unwrap();
    switching.await.unwrap().unwrap();

    assert_eq!(
        engine.get_mode().await,
        Mode::Local {
            model_id: "clip-test".to_string()
        }
    );
    let results = engine.search("east", 1, None).await.unwrap();
    assert_eq!(results[0].image_id, "first.png");
}

#[tokio::test]
async fn undownloaded_model_is_a_distinct_precondition_failure() {
    let (engine, _dir) = engine_with_corpus(TableFactory::known_corpus()).await;

    let err = engine
        .set_mode(ModeKind::Local, Some("clip-test"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::Registry(RegistryError::ModelNotDownloaded(_))
    ));
    assert_eq!(engine.get_mode().await, Mode::Remote);
}

#[tokio::test]
async fn unknown_model_is_not_found_not_precondition() {
    let (engine, _dir) = engine_with_corpus(TableFactory::known_corpus()).await;

    let err = engine
        .set_mode(ModeKind::Local, Some("imaginary"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::Registry(RegistryError::ModelNotFound(_))
    ));
}

#[tokio::test]
async fn model_download_state_is_visible() {
    let (engine, _dir) = engine_with_corpus(TableFactory::known_corpus()).await;

    assert!(!engine.is_model_downloaded("clip-test"));
    mark_downloaded(&engine, "clip-test");
    assert!(engine.is_model_downloaded("clip-test"));

    let models = engine.list_models();
    assert_eq!(models.len(), 1);
    assert!(models[0].downloaded);

    // Idempotent: already-downloaded means no fetch, the unroutable
    // catalog URL is never contacted.
    engine.download_model("clip-test").await.unwrap();
}
