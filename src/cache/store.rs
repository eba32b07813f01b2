//! Durable embedding storage.
//!
//! A thread-safe wrapper around rusqlite holding one row per corpus image:
//! the embedding vector, the content fingerprint it was computed from, and
//! the model that produced it. Survives process restarts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::corpus::CorpusError;
use crate::provider::{Embedding, ProviderError};

/// Errors that can occur during cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("embedding failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("corpus error: {0}")]
    Corpus(#[from] CorpusError),

    #[error("cache generation already running")]
    Busy,

    #[error("cache generation cancelled")]
    Cancelled,

    #[error("task failed: {0}")]
    Task(String),
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// One cached embedding with its staleness metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Image identifier within the corpus.
    pub image_id: String,
    /// The cached embedding vector.
    pub embedding: Embedding,
    /// Content fingerprint of the source image at embedding time.
    pub fingerprint: String,
    /// Model that produced the embedding.
    pub model_id: String,
    /// When the entry was last written.
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed store for cache entries.
///
/// Uses a Mutex so only one operation touches the connection at a time;
/// all work runs on blocking threads to stay off the async runtime.
#[derive(Clone)]
pub struct CacheStore {
    conn: Arc<Mutex<Connection>>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entries (
    image_id    TEXT PRIMARY KEY,
    vector      BLOB NOT NULL,
    fingerprint TEXT NOT NULL,
    model_id    TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
";

impl CacheStore {
    /// Opens the store at the given path, creating it if necessary.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory store for testing.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection> {
            let conn = Connection::open_in_memory()?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))?
        .map_err(CacheError::from)
    }

    /// Inserts or overwrites the entry for its image id.
    pub async fn upsert(&self, entry: CacheEntry) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO entries (image_id, vector, fingerprint, model_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(image_id) DO UPDATE SET
                     vector = excluded.vector,
                     fingerprint = excluded.fingerprint,
                     model_id = excluded.model_id,
                     updated_at = excluded.updated_at",
                params![
                    entry.image_id,
                    encode_vector(entry.embedding.values()),
                    entry.fingerprint,
                    entry.model_id,
                    entry.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Fetches the entry for an image id, if present.
    pub async fn get(&self, image_id: &str) -> Result<Option<CacheEntry>> {
        let image_id = image_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT image_id, vector, fingerprint, model_id, updated_at
                 FROM entries WHERE image_id = ?1",
                params![image_id],
                row_to_entry,
            )
            .optional()
        })
        .await
    }

    /// Fetches every entry.
    pub async fn all(&self) -> Result<Vec<CacheEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT image_id, vector, fingerprint, model_id, updated_at FROM entries",
            )?;
            let rows = stmt.query_map([], row_to_entry)?;
            rows.collect()
        })
        .await
    }

    /// Maps image id to stored fingerprint for every entry.
    pub async fn fingerprints(&self) -> Result<HashMap<String, String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT image_id, fingerprint FROM entries")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })
        .await
    }

    /// Removes the entry for an image id.
    pub async fn remove(&self, image_id: &str) -> Result<()> {
        let image_id = image_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM entries WHERE image_id = ?1", params![image_id])?;
            Ok(())
        })
        .await
    }

    /// Number of stored entries.
    pub async fn len(&self) -> Result<usize> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get::<_, i64>(0))
        })
        .await
        .map(|n| n as usize)
    }

    /// Whether the store holds no entries.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheEntry> {
    let vector: Vec<u8> = row.get(1)?;
    let updated_at: String = row.get(4)?;
    Ok(CacheEntry {
        image_id: row.get(0)?,
        embedding: Embedding::new(decode_vector(&vector)),
        fingerprint: row.get(2)?,
        model_id: row.get(3)?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// Packs f32 components as little-endian bytes.
fn encode_vector(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
