//! In-memory embedding index with cosine similarity search.
//!
//! Records are keyed by `path` for whole notes and `path#section` for heading
//! sections. All vectors in one index share the same dimensionality.

use std::collections::{BTreeMap, BTreeSet};

use crate::notes::DocumentRef;

/// One embedded unit: a whole note or one of its sections.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub key: String,
    pub vector: Vec<f32>,
    /// Cleaned text the vector was generated from
    pub content: String,
    /// SHA-256 hex of `content`
    pub content_hash: String,
    /// Source mtime (epoch ms) at generation time
    pub last_modified: i64,
    pub section_name: Option<String>,
    pub document: DocumentRef,
}

/// Build the record key for a note or one of its sections.
pub fn record_key(path: &str, section: Option<&str>) -> String {
    match section {
        Some(name) => format!("{path}#{name}"),
        None => path.to_string(),
    }
}

/// Whether `key` belongs to the document at `path`.
pub fn key_belongs_to(key: &str, path: &str) -> bool {
    match key.strip_prefix(path) {
        Some(rest) => rest.is_empty() || rest.starts_with('#'),
        None => false,
    }
}

/// Search hit from the vector index.
#[derive(Debug, Clone)]
pub struct SearchResult<'a> {
    pub record: &'a EmbeddingRecord,
    /// Cosine similarity score (-1.0 to 1.0)
    pub score: f32,
}

/// In-memory vector index.
///
/// Iteration order is key order, which makes search tie-breaking
/// deterministic.
#[derive(Debug, Default)]
pub struct VectorIndex {
    records: BTreeMap<String, EmbeddingRecord>,
    /// Fixed by the first inserted vector; 0 while undetermined
    dimensions: usize,
}

impl VectorIndex {
    /// Create an empty index whose dimensionality is set by the first insert.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty index with a declared dimensionality.
    pub fn with_dimensions(dimensions: usize) -> Self {
        Self {
            records: BTreeMap::new(),
            dimensions,
        }
    }

    /// Get the embedding dimensions, 0 if not yet known.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert or replace a record.
    ///
    /// Rejects vectors whose length differs from the index dimensionality and
    /// vectors with zero norm.
    pub fn insert(&mut self, record: EmbeddingRecord) -> Result<(), IndexError> {
        let len = record.vector.len();
        if len == 0 {
            return Err(IndexError::EmptyVector);
        }
        if self.dimensions != 0 && len != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: len,
            });
        }
        if l2_norm(&record.vector) < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        self.dimensions = len;
        self.records.insert(record.key.clone(), record);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&EmbeddingRecord> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Keys of every record owned by the document at `path`.
    pub fn keys_for_document(&self, path: &str) -> Vec<String> {
        self.records
            .range(path.to_string()..)
            .take_while(|(key, _)| key.starts_with(path))
            .filter(|(key, _)| key_belongs_to(key, path))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Remove every record keyed `path` or `path#...`.
    ///
    /// Returns the removed records.
    pub fn remove_for_document(&mut self, path: &str) -> Vec<EmbeddingRecord> {
        self.keys_for_document(path)
            .into_iter()
            .filter_map(|key| self.records.remove(&key))
            .collect()
    }

    /// Distinct document paths present in the index.
    pub fn document_paths(&self) -> BTreeSet<String> {
        self.records
            .values()
            .map(|r| r.document.path().to_string())
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EmbeddingRecord> {
        self.records.values()
    }

    /// Linear-scan cosine similarity search.
    ///
    /// Keeps records scoring strictly above `min_similarity`, sorted by score
    /// (highest first, ties in key order) and truncated to `limit`.
    pub fn search(
        &self,
        query: &[f32],
        min_similarity: f32,
        limit: usize,
    ) -> Result<Vec<SearchResult<'_>>, IndexError> {
        if self.dimensions != 0 && query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        let query_norm = l2_norm(query);
        if query_norm < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        let mut results: Vec<SearchResult<'_>> = self
            .records
            .values()
            .filter_map(|record| {
                let score = cosine_with_norm(query, &record.vector, query_norm);
                if score > min_similarity {
                    Some(SearchResult { record, score })
                } else {
                    None
                }
            })
            .collect();

        // stable: equal scores keep key order
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(limit);

        Ok(results)
    }

    /// Clear all records and forget the dimensionality.
    pub fn clear(&mut self) {
        self.records.clear();
        self.dimensions = 0;
    }
}

/// Cosine similarity of two vectors.
///
/// Returns 0.0 for vectors of different length or with zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = l2_norm(a);
    if norm_a < f32::EPSILON {
        return 0.0;
    }
    cosine_with_norm(a, b, norm_a)
}

fn cosine_with_norm(query: &[f32], target: &[f32], query_norm: f32) -> f32 {
    if query.len() != target.len() {
        return 0.0;
    }

    let target_norm = l2_norm(target);
    if target_norm < f32::EPSILON {
        return 0.0;
    }

    let dot_product: f32 = query.iter().zip(target.iter()).map(|(a, b)| a * b).sum();
    dot_product / (query_norm * target_norm)
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,

    #[error("Cannot store an empty vector")]
    EmptyVector,
}
