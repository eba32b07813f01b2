//! Engine settings and the static model catalog.
//!
//! Settings are persisted by the hosting process (e.g. under
//! `~/.config/glimpse/settings.json`) and handed to the core at startup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::registry::PerformanceTier;

/// Top-level engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Remote embedding API configuration.
    pub remote: RemoteSettings,
    /// Static catalog of local models.
    pub models: Vec<ModelEntry>,
    /// Embedding cache configuration.
    pub cache: CacheSettings,
    /// Directory where downloaded model artifacts live.
    pub models_dir: PathBuf,
    /// Search behavior configuration.
    pub search: SearchSettings,
    /// Retry bounds for the remote provider.
    pub retry: RetrySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            remote: RemoteSettings::default(),
            models: ModelEntry::builtin_catalog(),
            cache: CacheSettings::default(),
            models_dir: default_data_dir().join("models"),
            search: SearchSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

/// Remote embedding API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Bearer key for the embedding API.
    pub api_key: String,
    /// Base URL of the embedding API (OpenAI-compatible `/embeddings`).
    pub base_url: String,
    /// Model identifier to request from the API.
    pub model: String,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.siliconflow.cn/v1".to_string(),
            model: "BAAI/bge-m3".to_string(),
        }
    }
}

/// A row of the static local-model catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Model identifier.
    pub id: String,
    /// Performance tier label.
    pub tier: PerformanceTier,
    /// Embedding dimensionality this model produces.
    pub dimension: usize,
    /// URL of the safetensors weight artifact.
    pub weight_url: String,
    /// URL of the tokenizer JSON.
    pub tokenizer_url: String,
    /// Expected SHA-256 of the weight artifact (hex). Skipped when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Expected SHA-256 of the tokenizer (hex). Skipped when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer_sha256: Option<String>,
}

impl ModelEntry {
    /// The catalog shipped with the engine.
    pub fn builtin_catalog() -> Vec<ModelEntry> {
        vec![
            ModelEntry {
                id: "clip-vit-base-patch32".to_string(),
                tier: PerformanceTier::Fast,
                dimension: 512,
                weight_url:
                    "https://huggingface.co/openai/clip-vit-base-patch32/resolve/main/model.safetensors"
                        .to_string(),
                tokenizer_url:
                    "https://huggingface.co/openai/clip-vit-base-patch32/resolve/main/tokenizer.json"
                        .to_string(),
                sha256: None,
                tokenizer_sha256: None,
            },
            ModelEntry {
                id: "clip-vit-base-patch32-laion2b".to_string(),
                tier: PerformanceTier::Quality,
                dimension: 512,
                weight_url:
                    "https://huggingface.co/laion/CLIP-ViT-B-32-laion2B-s34B-b79K/resolve/main/model.safetensors"
                        .to_string(),
                tokenizer_url:
                    "https://huggingface.co/laion/CLIP-ViT-B-32-laion2B-s34B-b79K/resolve/main/tokenizer.json"
                        .to_string(),
                sha256: None,
                tokenizer_sha256: None,
            },
        ]
    }
}

/// Embedding cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Path of the SQLite cache database.
    pub db_path: PathBuf,
    /// Directory holding the image corpus.
    pub corpus_dir: PathBuf,
    /// Whether generation prunes entries for images removed from the corpus.
    pub prune_removed: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            db_path: data_dir.join("embeddings.db"),
            corpus_dir: data_dir.join("images"),
            prune_removed: false,
        }
    }
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "glimpse")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Search behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSettings {
    /// Default number of results when the caller does not specify `k`.
    pub default_results: usize,
    /// Capacity of the query-embedding memo.
    pub query_memo_size: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            default_results: 5,
            query_memo_size: 128,
        }
    }
}

/// Retry bounds for transient remote-provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Maximum attempts per request (first try included).
    pub max_attempts: u32,
    /// Base delay for exponential backoff, in milliseconds.
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}
