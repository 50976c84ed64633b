//! JSON persistence for the embedding index.
//!
//! File format: embeddings-cache.json
//!
//! ```text
//! { version, model, modelDimensions, createdAt, updatedAt,
//!   embeddings: { <key>: { vector, content, lastModified, contentHash,
//!                          sectionName?, file: { path, name, basename,
//!                                                stat: { mtime, ctime, size } } } } }
//! ```
//!
//! `vector` holds the packed float32 buffer in base64 (see `codec`). A file
//! whose version or model differs from the current configuration is treated
//! as absent.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::notes::{DocumentMeta, DocumentRef, DocumentStore};
use crate::semantic::codec::{decode_vector, encode_vector, CodecError};
use crate::semantic::index::{EmbeddingRecord, VectorIndex};
use crate::semantic::progress::now_millis;

/// Current cache schema version
pub const FORMAT_VERSION: &str = "1.0";

/// Cache file name inside the base directory
pub const CACHE_FILE_NAME: &str = "embeddings-cache.json";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Vector codec error: {0}")]
    Codec(#[from] CodecError),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheFile {
    version: String,
    model: String,
    model_dimensions: usize,
    created_at: i64,
    updated_at: i64,
    embeddings: BTreeMap<String, StoredRecord>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    vector: String,
    content: String,
    last_modified: i64,
    content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    section_name: Option<String>,
    file: DocumentMeta,
}

/// A persisted index as read back from disk.
#[derive(Debug)]
pub struct IndexSnapshot {
    pub version: String,
    pub model_name: String,
    pub model_dimensions: usize,
    pub created_at: i64,
    pub updated_at: i64,
    pub records: Vec<EmbeddingRecord>,
}

#[derive(Debug)]
pub enum LoadOutcome {
    /// No cache file
    Missing,
    /// Cache exists but cannot be used; callers treat it as missing
    Invalidated(String),
    Loaded(IndexSnapshot),
}

/// Reads and writes the cache file.
pub struct EmbeddingStorage {
    path: PathBuf,
    /// Creation time of the cache generation currently on disk
    created_at: Option<i64>,
}

impl EmbeddingStorage {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            created_at: None,
        }
    }

    pub fn in_dir(base_path: &Path) -> Self {
        Self::new(base_path.join(CACHE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the snapshot for `model`.
    ///
    /// Document references are re-resolved against `store`; records whose
    /// note is gone keep their stored metadata as [`DocumentRef::Stale`].
    pub fn load(
        &mut self,
        model: &str,
        store: &dyn DocumentStore,
    ) -> Result<LoadOutcome, StorageError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LoadOutcome::Missing),
            Err(e) => return Err(e.into()),
        };

        let cache: CacheFile = serde_json::from_slice(&data)?;

        if cache.version != FORMAT_VERSION {
            return Ok(LoadOutcome::Invalidated(format!(
                "cache version {} unsupported (expected {})",
                cache.version, FORMAT_VERSION
            )));
        }
        if cache.model != model {
            return Ok(LoadOutcome::Invalidated(format!(
                "model changed from {} to {}",
                cache.model, model
            )));
        }

        let mut records = Vec::with_capacity(cache.embeddings.len());
        for (key, stored) in cache.embeddings {
            let vector = match decode_vector(&stored.vector) {
                Ok(vector) => vector,
                Err(e) => {
                    return Ok(LoadOutcome::Invalidated(format!(
                        "record {key} has an undecodable vector: {e}"
                    )))
                }
            };
            if vector.len() != cache.model_dimensions {
                return Ok(LoadOutcome::Invalidated(format!(
                    "record {key} has {} dimensions, cache declares {}",
                    vector.len(),
                    cache.model_dimensions
                )));
            }

            records.push(EmbeddingRecord {
                key,
                vector,
                content: stored.content,
                content_hash: stored.content_hash,
                last_modified: stored.last_modified,
                section_name: stored.section_name,
                document: DocumentRef::Stale(stored.file).resolve(store),
            });
        }

        self.created_at = Some(cache.created_at);

        Ok(LoadOutcome::Loaded(IndexSnapshot {
            version: cache.version,
            model_name: cache.model,
            model_dimensions: cache.model_dimensions,
            created_at: cache.created_at,
            updated_at: cache.updated_at,
            records,
        }))
    }

    /// Read the header and records without validating against a model.
    ///
    /// Used for offline inspection; document references stay stale.
    pub fn inspect(&self) -> Result<Option<IndexSnapshot>, StorageError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let cache: CacheFile = serde_json::from_slice(&data)?;

        let mut records = Vec::with_capacity(cache.embeddings.len());
        for (key, stored) in cache.embeddings {
            records.push(EmbeddingRecord {
                key,
                vector: decode_vector(&stored.vector)?,
                content: stored.content,
                content_hash: stored.content_hash,
                last_modified: stored.last_modified,
                section_name: stored.section_name,
                document: DocumentRef::Stale(stored.file),
            });
        }

        Ok(Some(IndexSnapshot {
            version: cache.version,
            model_name: cache.model,
            model_dimensions: cache.model_dimensions,
            created_at: cache.created_at,
            updated_at: cache.updated_at,
            records,
        }))
    }

    /// Write the whole index for `model`.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&mut self, index: &VectorIndex, model: &str) -> Result<(), StorageError> {
        let now = now_millis();
        let created_at = *self.created_at.get_or_insert(now);

        let embeddings = index
            .iter()
            .map(|record| {
                (
                    record.key.clone(),
                    StoredRecord {
                        vector: encode_vector(&record.vector),
                        content: record.content.clone(),
                        last_modified: record.last_modified,
                        content_hash: record.content_hash.clone(),
                        section_name: record.section_name.clone(),
                        file: record.document.meta().clone(),
                    },
                )
            })
            .collect();

        let cache = CacheFile {
            version: FORMAT_VERSION.to_string(),
            model: model.to_string(),
            model_dimensions: index.dimensions(),
            created_at,
            updated_at: now,
            embeddings,
        };
        let data = serde_json::to_vec(&cache)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let temp_path = self.path.with_extension("tmp");
        if let Err(e) = write_synced(&temp_path, &data) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }
        std::fs::rename(&temp_path, &self.path)?;

        log::debug!(
            "saved {} embeddings to {}",
            index.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Delete the cache file if it exists.
    pub fn delete(&mut self) -> Result<(), StorageError> {
        self.created_at = None;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut file = std::fs::File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

/// Trailing-edge debounce for cache writes.
///
/// A save becomes due once no mutation happened for `window`, or once the
/// oldest unsaved mutation is `max_wait` old.
#[derive(Debug)]
pub struct SaveDebouncer {
    window: Duration,
    max_wait: Duration,
    first_change: Option<Instant>,
    last_change: Option<Instant>,
}

impl SaveDebouncer {
    pub fn new(window: Duration, max_wait: Duration) -> Self {
        Self {
            window,
            max_wait: max_wait.max(window),
            first_change: None,
            last_change: None,
        }
    }

    pub fn mark_dirty(&mut self, now: Instant) {
        self.first_change.get_or_insert(now);
        self.last_change = Some(now);
    }

    pub fn is_dirty(&self) -> bool {
        self.last_change.is_some()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match (self.first_change, self.last_change) {
            (Some(first), Some(last)) => {
                now.saturating_duration_since(last) >= self.window
                    || now.saturating_duration_since(first) >= self.max_wait
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.first_change = None;
        self.last_change = None;
    }
}
