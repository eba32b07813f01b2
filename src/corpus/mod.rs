//! Corpus enumeration and content fingerprinting.
//!
//! The corpus is the set of images eligible for indexing. Fingerprints are
//! SHA-256 content hashes used to detect stale cache entries.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use ring::digest::{Context, SHA256};
use thiserror::Error;

/// Errors that can occur while enumerating the corpus.
#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corpus directory does not exist: {0}")]
    MissingDirectory(PathBuf),
}

/// Result type for corpus operations.
pub type Result<T> = std::result::Result<T, CorpusError>;

/// File extensions treated as images.
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];

/// A single indexable image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusItem {
    /// Stable identifier, unique within the corpus.
    pub id: String,
    /// Path of the image file.
    pub path: PathBuf,
}

/// Source of images to index.
pub trait Corpus: Send + Sync {
    /// Enumerates the current corpus snapshot.
    fn items(&self) -> Result<Vec<CorpusItem>>;
}

/// Corpus backed by a flat directory of image files.
///
/// The file name (with extension) serves as the image identifier.
#[derive(Debug, Clone)]
pub struct DirectoryCorpus {
    root: PathBuf,
}

impl DirectoryCorpus {
    /// Creates a corpus over the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the corpus root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Corpus for DirectoryCorpus {
    fn items(&self) -> Result<Vec<CorpusItem>> {
        if !self.root.is_dir() {
            return Err(CorpusError::MissingDirectory(self.root.clone()));
        }

        let entries = fs::read_dir(&self.root).map_err(|source| CorpusError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut items = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CorpusError::Io {
                path: self.root.clone(),
                source,
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if !is_image {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            items.push(CorpusItem {
                id: name.to_string(),
                path,
            });
        }

        // Stable enumeration order keeps generation logs and tests deterministic.
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }
}

/// Computes the hex-encoded SHA-256 fingerprint of a file's contents.
pub fn fingerprint(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).map_err(|source| CorpusError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut context = Context::new(&SHA256);
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).map_err(|source| CorpusError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if n == 0 {
            break;
        }
        context.update(&buf[..n]);
    }

    Ok(hex_encode(context.finish().as_ref()))
}

/// Hex-encodes a byte slice.
pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut out, byte| {
            use std::fmt::Write;
            let _ = write!(out, "{:02x}", byte);
            out
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn directory_corpus_lists_images_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.png"), b"bbb").unwrap();
        fs::write(dir.path().join("a.jpg"), b"aaa").unwrap();
        fs::write(dir.path().join("notes.txt"), b"not an image").unwrap();

        let corpus = DirectoryCorpus::new(dir.path());
        let items = corpus.items().unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "a.jpg");
        assert_eq!(items[1].id, "b.png");
    }

    #[test]
    fn directory_corpus_ignores_case_of_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("shout.PNG"), b"img").unwrap();

        let corpus = DirectoryCorpus::new(dir.path());
        assert_eq!(corpus.items().unwrap().len(), 1);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let corpus = DirectoryCorpus::new("/nonexistent/glimpse-test");
        assert!(matches!(
            corpus.items(),
            Err(CorpusError::MissingDirectory(_))
        ));
    }

    #[test]
    fn fingerprint_is_stable_for_same_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.png");
        fs::write(&path, b"pixels").unwrap();

        let a = fingerprint(&path).unwrap();
        let b = fingerprint(&path).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.png");

        fs::write(&path, b"before").unwrap();
        let a = fingerprint(&path).unwrap();

        fs::write(&path, b"after").unwrap();
        let b = fingerprint(&path).unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn hex_encoding() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x10]), "00ff10");
    }
}
