//! Model descriptors and the registry catalog.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use ring::digest::{Context, SHA256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ModelEntry;
use crate::corpus::hex_encode;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("model not found in catalog: {0}")]
    ModelNotFound(String),

    #[error("model not downloaded: {0}")]
    ModelNotDownloaded(String),

    #[error("artifact integrity check failed for {model_id}: expected {expected}, got {actual}")]
    DownloadIntegrity {
        model_id: String,
        expected: String,
        actual: String,
    },

    #[error("download request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("download cancelled: {0}")]
    Cancelled(String),
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Performance tier label for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTier {
    /// Small and quick, lower retrieval quality.
    Fast,
    /// Middle ground.
    Balanced,
    /// Larger model, best retrieval quality.
    Quality,
}

/// A known local model and the on-disk location of its artifacts.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    /// Model identifier.
    pub id: String,
    /// Performance tier label.
    pub tier: PerformanceTier,
    /// Embedding dimensionality.
    pub dimension: usize,
    /// URL of the safetensors weights.
    pub weight_url: String,
    /// URL of the tokenizer JSON.
    pub tokenizer_url: String,
    /// Expected SHA-256 of the weights (hex), when configured.
    pub sha256: Option<String>,
    /// Expected SHA-256 of the tokenizer (hex), when configured.
    pub tokenizer_sha256: Option<String>,
    /// Local path of the weights.
    pub weight_path: PathBuf,
    /// Local path of the tokenizer.
    pub tokenizer_path: PathBuf,
}

impl ModelDescriptor {
    fn from_entry(entry: &ModelEntry, models_dir: &Path) -> Self {
        let model_dir = models_dir.join(&entry.id);
        Self {
            id: entry.id.clone(),
            tier: entry.tier,
            dimension: entry.dimension,
            weight_url: entry.weight_url.clone(),
            tokenizer_url: entry.tokenizer_url.clone(),
            sha256: entry.sha256.clone(),
            tokenizer_sha256: entry.tokenizer_sha256.clone(),
            weight_path: model_dir.join("model.safetensors"),
            tokenizer_path: model_dir.join("tokenizer.json"),
        }
    }
}

/// Read-only view of a catalog row plus its download state.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    /// Model identifier.
    pub id: String,
    /// Performance tier label.
    pub tier: PerformanceTier,
    /// Whether the artifacts are on disk and verified.
    pub downloaded: bool,
}

/// Catalog of known models with verified artifact management.
pub struct ModelRegistry {
    catalog: Vec<ModelDescriptor>,
    /// Model ids whose artifacts have passed verification this process.
    verified: RwLock<HashSet<String>>,
    /// Per-model download locks (single-flight per id).
    pub(super) inflight: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    pub(super) client: reqwest::Client,
}

impl ModelRegistry {
    /// Builds the registry from the static catalog, rooting artifact paths
    /// under `models_dir`.
    pub fn new(entries: &[ModelEntry], models_dir: impl AsRef<Path>) -> Self {
        let models_dir = models_dir.as_ref();
        let catalog = entries
            .iter()
            .map(|entry| ModelDescriptor::from_entry(entry, models_dir))
            .collect();
        Self {
            catalog,
            verified: RwLock::new(HashSet::new()),
            inflight: tokio::sync::Mutex::new(HashMap::new()),
            client: reqwest::Client::new(),
        }
    }

    /// Read-only view of the catalog.
    pub fn list(&self) -> &[ModelDescriptor] {
        &self.catalog
    }

    /// Catalog rows with their current download state.
    pub fn summaries(&self) -> Vec<ModelSummary> {
        self.catalog
            .iter()
            .map(|desc| ModelSummary {
                id: desc.id.clone(),
                tier: desc.tier,
                downloaded: self.is_downloaded(&desc.id),
            })
            .collect()
    }

    /// Looks up a descriptor by id.
    pub fn get(&self, model_id: &str) -> Result<&ModelDescriptor> {
        self.catalog
            .iter()
            .find(|desc| desc.id == model_id)
            .ok_or_else(|| RegistryError::ModelNotFound(model_id.to_string()))
    }

    /// Whether the model's artifacts exist on disk and have passed
    /// integrity verification.
    ///
    /// Verification results are memoized; a model whose files disappear
    /// after verification reverts to not-downloaded.
    pub fn is_downloaded(&self, model_id: &str) -> bool {
        let Ok(desc) = self.get(model_id) else {
            return false;
        };

        let on_disk = desc.weight_path.is_file() && desc.tokenizer_path.is_file();
        if !on_disk {
            self.verified
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(model_id);
            return false;
        }

        if self
            .verified
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(model_id)
        {
            return true;
        }

        let ok = artifact_matches(&desc.weight_path, desc.sha256.as_deref())
            && artifact_matches(&desc.tokenizer_path, desc.tokenizer_sha256.as_deref());
        if ok {
            self.mark_verified(model_id);
        }
        ok
    }

    pub(super) fn mark_verified(&self, model_id: &str) {
        self.verified
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(model_id.to_string());
    }
}

/// Checks an on-disk artifact against an optional expected checksum.
///
/// With no configured checksum, presence alone is accepted.
pub(super) fn artifact_matches(path: &Path, expected_sha256: Option<&str>) -> bool {
    if !path.is_file() {
        return false;
    }
    let Some(expected) = expected_sha256 else {
        return true;
    };
    match file_sha256(path) {
        Ok(actual) => actual.eq_ignore_ascii_case(expected),
        Err(_) => false,
    }
}

/// Hex-encoded SHA-256 of a file.
pub(super) fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut context = Context::new(&SHA256);
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.update(&buf[..n]);
    }
    Ok(hex_encode(context.finish().as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_entry(id: &str) -> ModelEntry {
        ModelEntry {
            id: id.to_string(),
            tier: PerformanceTier::Fast,
            dimension: 512,
            weight_url: "https://example.com/model.safetensors".to_string(),
            tokenizer_url: "https://example.com/tokenizer.json".to_string(),
            sha256: None,
            tokenizer_sha256: None,
        }
    }

    fn write_artifacts(registry: &ModelRegistry, id: &str) {
        let desc = registry.get(id).unwrap();
        fs::create_dir_all(desc.weight_path.parent().unwrap()).unwrap();
        fs::write(&desc.weight_path, b"weights").unwrap();
        fs::write(&desc.tokenizer_path, b"tokenizer").unwrap();
    }

    #[test]
    fn unknown_model_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(&[test_entry("a")], dir.path());

        assert!(matches!(
            registry.get("missing"),
            Err(RegistryError::ModelNotFound(_))
        ));
        assert!(!registry.is_downloaded("missing"));
    }

    #[test]
    fn fresh_model_is_not_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(&[test_entry("a")], dir.path());
        assert!(!registry.is_downloaded("a"));
    }

    #[test]
    fn present_artifacts_without_checksum_count_as_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(&[test_entry("a")], dir.path());
        write_artifacts(&registry, "a");

        assert!(registry.is_downloaded("a"));
    }

    #[test]
    fn checksum_mismatch_means_not_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let mut entry = test_entry("a");
        entry.sha256 = Some("0".repeat(64));
        let registry = ModelRegistry::new(&[entry], dir.path());
        write_artifacts(&registry, "a");

        assert!(!registry.is_downloaded("a"));
    }

    #[test]
    fn matching_checksum_is_verified() {
        let dir = tempfile::tempdir().unwrap();
        let mut entry = test_entry("a");
        // Set up files first to compute the real digest.
        let registry = ModelRegistry::new(&[entry.clone()], dir.path());
        write_artifacts(&registry, "a");
        let desc = registry.get("a").unwrap();
        entry.sha256 = Some(file_sha256(&desc.weight_path).unwrap());

        let registry = ModelRegistry::new(&[entry], dir.path());
        assert!(registry.is_downloaded("a"));
    }

    #[test]
    fn deleted_artifacts_revert_to_not_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(&[test_entry("a")], dir.path());
        write_artifacts(&registry, "a");
        assert!(registry.is_downloaded("a"));

        let desc = registry.get("a").unwrap();
        fs::remove_file(&desc.weight_path).unwrap();

        assert!(!registry.is_downloaded("a"));
    }

    #[test]
    fn summaries_reflect_state() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(&[test_entry("a"), test_entry("b")], dir.path());
        write_artifacts(&registry, "b");

        let summaries = registry.summaries();
        assert_eq!(summaries.len(), 2);
        assert!(!summaries[0].downloaded);
        assert!(summaries[1].downloaded);
    }
}
