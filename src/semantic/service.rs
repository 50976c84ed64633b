//! Embedding index service.
//!
//! Owns the in-memory index and coordinates everything that mutates it:
//! - initialization (backend handshake, cache load, first build)
//! - batch and per-document regeneration with change detection
//! - eviction of deleted or renamed documents
//! - debounced persistence and progress notifications
//!
//! All mutation goes through `&mut self`, so two mutations never interleave.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::notes::{is_ignored, DocumentMeta, DocumentRef, DocumentStore, DocumentStoreError};
use crate::semantic::change::{content_changed, needs_regeneration};
use crate::semantic::clock::{Clock, SystemClock};
use crate::semantic::embeddings::{Embedder, EmbeddingError};
use crate::semantic::events::EventSink;
use crate::semantic::index::{record_key, EmbeddingRecord, IndexError, VectorIndex};
use crate::semantic::preprocess::{clean_content, content_hash, truncate_chars};
use crate::semantic::progress::{IndexStats, ProgressReporter, ProgressState};
use crate::semantic::storage::{EmbeddingStorage, LoadOutcome, SaveDebouncer, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingServiceError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("embedding backend is unreachable")]
    BackendUnreachable,

    #[error("embedding generation failed: {0}")]
    Generation(#[from] EmbeddingError),

    #[error("too many errors during generation ({errors} failures after {processed} documents)")]
    TooManyErrors { errors: usize, processed: usize },

    #[error("document error: {0}")]
    Document(#[from] DocumentStoreError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("embedding service is not ready")]
    NotReady,

    #[error("a generation batch is already running")]
    AlreadyRunning,
}

type Result<T> = std::result::Result<T, EmbeddingServiceError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    Uninitialized,
    Initializing,
    Ready,
}

/// Tunables of the service.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Embedding model name; empty means not configured
    pub model: String,
    pub ignored_folders: Vec<String>,
    /// Default number of search results
    pub max_relevant_notes: usize,
    /// Default search threshold, results must score strictly above it
    pub min_similarity: f32,
    /// A batch aborts once its error count exceeds this
    pub max_batch_errors: usize,
    /// Text is cut to this many characters before embedding
    pub max_embedding_chars: usize,
    pub result_excerpt_chars: usize,
    pub save_debounce: Duration,
    pub save_max_wait: Duration,
    /// Pause after every this many embedded documents
    pub throttle_every: usize,
    pub throttle_pause: Duration,
    /// Documents between coalesced progress notifications
    pub progress_every: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            model: crate::semantic::DEFAULT_MODEL.to_string(),
            ignored_folders: Vec::new(),
            max_relevant_notes: 5,
            min_similarity: 0.1,
            max_batch_errors: 10,
            max_embedding_chars: 512,
            result_excerpt_chars: 500,
            save_debounce: Duration::from_secs(5),
            save_max_wait: Duration::from_secs(60),
            throttle_every: 3,
            throttle_pause: Duration::from_millis(200),
            progress_every: 5,
        }
    }
}

/// What happened to a single document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentOutcome {
    /// Records are current, nothing was generated
    Unchanged,
    /// Records were replaced; `embedded` of them needed a new vector
    Updated { records: usize, embedded: usize },
    /// Path is excluded from indexing
    Ignored,
}

impl DocumentOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, Self::Updated { .. })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub processed: usize,
    /// Documents that had no records before
    pub added: usize,
    /// Documents whose existing records were replaced
    pub updated: usize,
    pub unchanged: usize,
    pub errors: usize,
    pub cancelled: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub updated: usize,
    pub added: usize,
    pub removed: usize,
}

/// Ranked search hit.
#[derive(Clone, Debug, Serialize)]
pub struct SearchHit {
    pub key: String,
    pub document: DocumentRef,
    pub section_name: Option<String>,
    pub excerpt: String,
    pub similarity: f32,
}

pub struct EmbeddingService {
    config: ServiceConfig,
    state: ServiceState,
    embedder: Arc<dyn Embedder>,
    documents: Arc<dyn DocumentStore>,
    index: VectorIndex,
    storage: EmbeddingStorage,
    pending_save: SaveDebouncer,
    progress: ProgressReporter,
    clock: Arc<dyn Clock>,
    cancel: Arc<AtomicBool>,
}

impl EmbeddingService {
    pub fn new(
        config: ServiceConfig,
        embedder: Arc<dyn Embedder>,
        documents: Arc<dyn DocumentStore>,
        storage: EmbeddingStorage,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let pending_save = SaveDebouncer::new(config.save_debounce, config.save_max_wait);
        let progress = ProgressReporter::new(events, config.progress_every);

        Self {
            config,
            state: ServiceState::Uninitialized,
            embedder,
            documents,
            index: VectorIndex::new(),
            storage,
            pending_save,
            progress,
            clock: Arc::new(SystemClock),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ServiceState::Ready
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn progress(&self) -> ProgressState {
        self.progress.state()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats::from_index(&self.index)
    }

    /// Flag checked between documents of a batch; setting it stops the batch
    /// after the document in flight.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Handshake with the backend, load the cache and build it if missing.
    ///
    /// A no-op while initializing or ready. Configuration and connectivity
    /// failures leave the service uninitialized so the call can be retried.
    /// A build that aborts with too many errors is returned as an error but
    /// the service stays ready.
    pub fn initialize(&mut self) -> Result<()> {
        if self.state != ServiceState::Uninitialized {
            log::debug!("initialize skipped, service is {:?}", self.state);
            return Ok(());
        }

        self.state = ServiceState::Initializing;
        if let Err(e) = self.handshake() {
            log::error!("failed to initialize embedding service: {e}");
            self.state = ServiceState::Uninitialized;
            self.progress.fail(&e.to_string());
            return Err(e);
        }

        let loaded = self.load_cache();
        self.state = ServiceState::Ready;

        let result = if loaded {
            Ok(())
        } else {
            self.regenerate_all().map(|_| ())
        };

        log::info!(
            "embedding service ready: {} embeddings for {} notes",
            self.index.len(),
            self.index.document_paths().len()
        );
        self.progress.emit_initialized(self.stats());

        result
    }

    fn handshake(&self) -> Result<()> {
        if self.config.model.trim().is_empty() {
            return Err(EmbeddingServiceError::Configuration(
                "no embedding model selected".to_string(),
            ));
        }
        if !self.embedder.test_connection() {
            return Err(EmbeddingServiceError::BackendUnreachable);
        }
        Ok(())
    }

    /// Replace the index with the persisted snapshot. False when the cache is
    /// absent or unusable.
    fn load_cache(&mut self) -> bool {
        let outcome = match self.storage.load(&self.config.model, self.documents.as_ref()) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!(
                    "failed to read embedding cache {}: {e}",
                    self.storage.path().display()
                );
                return false;
            }
        };

        match outcome {
            LoadOutcome::Missing => {
                log::info!("no embedding cache, building from scratch");
                false
            }
            LoadOutcome::Invalidated(reason) => {
                log::info!("embedding cache invalidated ({reason}), rebuilding");
                if let Err(e) = self.storage.delete() {
                    log::warn!("failed to delete stale embedding cache: {e}");
                }
                false
            }
            LoadOutcome::Loaded(snapshot) => {
                let mut index = VectorIndex::with_dimensions(snapshot.model_dimensions);
                for record in snapshot.records {
                    let key = record.key.clone();
                    if let Err(e) = index.insert(record) {
                        log::warn!("dropping cached embedding {key}: {e}");
                    }
                }
                log::info!("loaded {} embeddings from cache", index.len());
                self.index = index;
                true
            }
        }
    }

    /// Regenerate every eligible document that changed.
    pub fn regenerate_all(&mut self) -> Result<BatchSummary> {
        self.ensure_ready()?;
        let documents = self.eligible_documents()?;
        self.run_batch(documents)
    }

    /// Drop records of notes that vanished or became ignored, then
    /// regenerate whatever changed.
    pub fn sync(&mut self) -> Result<SyncSummary> {
        self.ensure_ready()?;
        if self.progress.is_running() {
            return Err(EmbeddingServiceError::AlreadyRunning);
        }

        let documents = self.eligible_documents()?;
        let live: BTreeSet<&str> = documents.iter().map(|d| d.path.as_str()).collect();

        let mut removed = 0;
        for path in self.index.document_paths() {
            if !live.contains(path.as_str()) {
                log::info!("removing embeddings of {path}");
                self.remove_for_document(&path);
                removed += 1;
            }
        }

        let batch = self.run_batch(documents)?;

        Ok(SyncSummary {
            updated: batch.updated,
            added: batch.added,
            removed,
        })
    }

    /// Clear the index and the cache file, then build everything again.
    pub fn rebuild(&mut self) -> Result<BatchSummary> {
        self.ensure_ready()?;
        if self.progress.is_running() {
            return Err(EmbeddingServiceError::AlreadyRunning);
        }

        self.index.clear();
        self.pending_save.clear();
        if let Err(e) = self.storage.delete() {
            log::warn!("failed to delete embedding cache: {e}");
        }
        self.progress.emit_stats(self.stats());

        self.regenerate_all()
    }

    fn run_batch(&mut self, documents: Vec<DocumentMeta>) -> Result<BatchSummary> {
        if self.progress.is_running() {
            return Err(EmbeddingServiceError::AlreadyRunning);
        }

        self.progress.begin(documents.len(), self.stats());
        log::info!("checking {} notes for changes", documents.len());

        let mut summary = BatchSummary::default();
        let mut embedded_docs = 0;

        for meta in &documents {
            if self.cancel.swap(false, Ordering::SeqCst) {
                log::warn!("generation cancelled after {} notes", summary.processed);
                summary.cancelled = true;
                break;
            }

            let existed = !self.index.keys_for_document(&meta.path).is_empty();
            summary.processed += 1;

            match self.process_document(meta, false) {
                Ok(outcome) => {
                    match outcome {
                        DocumentOutcome::Updated { embedded, .. } => {
                            if existed {
                                summary.updated += 1;
                            } else {
                                summary.added += 1;
                            }
                            if embedded > 0 {
                                embedded_docs += 1;
                                self.throttle(embedded_docs);
                            }
                        }
                        DocumentOutcome::Unchanged | DocumentOutcome::Ignored => {
                            log::debug!("{} is up to date", meta.path);
                            summary.unchanged += 1;
                        }
                    }
                    let index = &self.index;
                    self.progress.record_success(&meta.path, outcome.is_updated(), || {
                        IndexStats::from_index(index)
                    });
                }
                Err(e) => {
                    log::error!("failed to generate embeddings for {}: {e}", meta.path);
                    summary.errors += 1;
                    let index = &self.index;
                    self.progress
                        .record_error(&meta.path, || IndexStats::from_index(index));

                    if summary.errors > self.config.max_batch_errors {
                        let err = EmbeddingServiceError::TooManyErrors {
                            errors: summary.errors,
                            processed: summary.processed,
                        };
                        log::error!("aborting generation: {err}");
                        self.progress.abort(self.stats(), &err.to_string());
                        return Err(err);
                    }
                }
            }

            self.tick();
        }

        log::info!(
            "generation finished: {} added, {} updated, {} unchanged, {} errors",
            summary.added,
            summary.updated,
            summary.unchanged,
            summary.errors
        );
        self.progress.finish(self.stats());

        Ok(summary)
    }

    fn throttle(&self, embedded_docs: usize) {
        if self.config.throttle_pause.is_zero() || self.config.throttle_every == 0 {
            return;
        }
        if embedded_docs % self.config.throttle_every == 0 {
            std::thread::sleep(self.config.throttle_pause);
        }
    }

    /// Bring one document up to date.
    ///
    /// Generation failures are returned to the caller rather than counted.
    pub fn regenerate_one(&mut self, path: &str) -> Result<DocumentOutcome> {
        self.update_document(path, false)
    }

    /// Re-embed one document even if nothing changed.
    pub fn force_regenerate(&mut self, path: &str) -> Result<DocumentOutcome> {
        self.update_document(path, true)
    }

    fn update_document(&mut self, path: &str, force: bool) -> Result<DocumentOutcome> {
        self.ensure_ready()?;
        if is_ignored(path, &self.config.ignored_folders) {
            return Ok(DocumentOutcome::Ignored);
        }

        let meta = self
            .documents
            .stat(path)
            .ok_or_else(|| DocumentStoreError::NotFound(path.to_string()))?;

        match self.process_document(&meta, force) {
            Ok(outcome) => {
                if outcome.is_updated() {
                    self.progress.file_processed(path, true);
                    self.progress.emit_stats(self.stats());
                }
                Ok(outcome)
            }
            Err(e) => {
                self.progress.file_processed(path, false);
                Err(e)
            }
        }
    }

    /// Delete every record of `path`. Returns how many were removed.
    pub fn remove_for_document(&mut self, path: &str) -> usize {
        let removed = self.index.remove_for_document(path).len();
        if removed > 0 {
            log::debug!("removed {removed} embeddings of {path}");
            self.pending_save.mark_dirty(self.clock.now());
            self.progress.emit_stats(self.stats());
        }
        removed
    }

    /// Split, detect changes, embed and swap the document's records.
    ///
    /// New records are built before anything is removed, so a failure leaves
    /// the previous records in place.
    fn process_document(&mut self, meta: &DocumentMeta, force: bool) -> Result<DocumentOutcome> {
        let path = meta.path.as_str();
        let note = self.documents.read(path)?;

        let units: Vec<(Option<String>, String)> = if note.sections.is_empty() {
            vec![(None, clean_content(&note.body))]
        } else {
            note.sections
                .into_iter()
                .map(|section| (Some(section.name), clean_content(&section.content)))
                .collect()
        };
        let units: Vec<(String, Option<String>, String)> = units
            .into_iter()
            .filter(|(_, content)| !content.is_empty())
            .map(|(section, content)| (record_key(path, section.as_deref()), section, content))
            .collect();

        let old_keys: BTreeSet<String> = self.index.keys_for_document(path).into_iter().collect();
        let new_keys: BTreeSet<&str> = units.iter().map(|(key, _, _)| key.as_str()).collect();

        let changed = force
            || old_keys.len() != new_keys.len()
            || old_keys.iter().any(|k| !new_keys.contains(k.as_str()))
            || units.iter().any(|(key, _, content)| {
                needs_regeneration(self.index.get(key), content, meta.stat.mtime)
            });
        if !changed {
            return Ok(DocumentOutcome::Unchanged);
        }

        let mut fresh = Vec::with_capacity(units.len());
        let mut embedded = 0;
        for (key, section_name, content) in units {
            let existing = self.index.get(&key);
            let vector = match existing {
                Some(record) if !force && !content_changed(existing, &content) => {
                    record.vector.clone()
                }
                _ => {
                    embedded += 1;
                    self.embed(&content)?
                }
            };

            fresh.push(EmbeddingRecord {
                key,
                vector,
                content_hash: content_hash(&content),
                content,
                last_modified: meta.stat.mtime,
                section_name,
                document: DocumentRef::Live(meta.clone()),
            });
        }

        let records = fresh.len();
        let previous = self.index.remove_for_document(path);
        for record in fresh {
            if let Err(e) = self.index.insert(record) {
                self.index.remove_for_document(path);
                for old in previous {
                    let _ = self.index.insert(old);
                }
                return Err(e.into());
            }
        }

        log::debug!("{path}: {records} records, {embedded} embedded");
        self.pending_save.mark_dirty(self.clock.now());

        Ok(DocumentOutcome::Updated { records, embedded })
    }

    fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        let input = truncate_chars(text, self.config.max_embedding_chars);
        self.embedder.generate(input, &self.config.model)
    }

    /// Rank indexed notes against `query`.
    ///
    /// `limit` and `min_similarity` fall back to the configured defaults.
    pub fn search(
        &self,
        query: &str,
        limit: Option<usize>,
        min_similarity: Option<f32>,
    ) -> Result<Vec<SearchHit>> {
        self.ensure_ready()?;

        let query = query.trim();
        if query.is_empty() || self.index.is_empty() {
            return Ok(Vec::new());
        }

        let vector = self.embed(query)?;
        let results = self.index.search(
            &vector,
            min_similarity.unwrap_or(self.config.min_similarity),
            limit.unwrap_or(self.config.max_relevant_notes),
        )?;

        Ok(results
            .into_iter()
            .map(|hit| SearchHit {
                key: hit.record.key.clone(),
                document: hit.record.document.clone().resolve(self.documents.as_ref()),
                section_name: hit.record.section_name.clone(),
                excerpt: truncate_chars(&hit.record.content, self.config.result_excerpt_chars)
                    .to_string(),
                similarity: hit.score,
            })
            .collect())
    }

    /// Switch to `model`, rebuilding against it. Returns true if the model
    /// changed while the service was ready.
    pub fn check_update_model(&mut self, model: &str) -> Result<bool> {
        if model == self.config.model {
            return Ok(false);
        }

        if !self.is_ready() {
            self.config.model = model.to_string();
            return Ok(false);
        }

        log::info!("embedding model changed from {} to {model}", self.config.model);
        self.cleanup();
        self.config.model = model.to_string();
        self.initialize()?;
        Ok(true)
    }

    /// Save now if the debounce window elapsed.
    pub fn tick(&mut self) {
        if self.pending_save.is_due(self.clock.now()) {
            if let Err(e) = self.save() {
                log::error!("failed to save embedding cache: {e}");
            }
        }
    }

    /// Save immediately if anything changed. Returns whether a write happened.
    pub fn flush(&mut self) -> std::result::Result<bool, StorageError> {
        if !self.pending_save.is_dirty() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    fn save(&mut self) -> std::result::Result<(), StorageError> {
        // a failed write is not retried until the next mutation
        self.pending_save.clear();
        self.storage.save(&self.index, &self.config.model)
    }

    /// Flush pending writes and return to the uninitialized state.
    pub fn cleanup(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("failed to save embedding cache: {e}");
        }
        self.index.clear();
        self.progress.reset();
        self.state = ServiceState::Uninitialized;
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state == ServiceState::Ready {
            Ok(())
        } else {
            Err(EmbeddingServiceError::NotReady)
        }
    }

    fn eligible_documents(&self) -> Result<Vec<DocumentMeta>> {
        Ok(self
            .documents
            .list_documents()?
            .into_iter()
            .filter(|doc| !is_ignored(&doc.path, &self.config.ignored_folders))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::clock::ManualClock;
    use crate::semantic::events::{IndexEvent, NullSink};
    use crate::tests::fakes::{
        BagOfWordsEmbedder, FailingEmbedder, MemoryDocumentStore, RecordingSink,
    };

    fn test_config() -> ServiceConfig {
        ServiceConfig {
            throttle_pause: Duration::ZERO,
            ..ServiceConfig::default()
        }
    }

    fn service_with(
        store: Arc<MemoryDocumentStore>,
        embedder: Arc<dyn Embedder>,
        dir: &std::path::Path,
    ) -> EmbeddingService {
        EmbeddingService::new(
            test_config(),
            embedder,
            store,
            EmbeddingStorage::in_dir(dir),
            Arc::new(NullSink),
        )
    }

    #[test]
    fn test_initialize_requires_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = EmbeddingService::new(
            ServiceConfig {
                model: String::new(),
                ..test_config()
            },
            Arc::new(BagOfWordsEmbedder::new()),
            Arc::new(MemoryDocumentStore::new()),
            EmbeddingStorage::in_dir(dir.path()),
            Arc::new(NullSink),
        );

        assert!(matches!(
            service.initialize(),
            Err(EmbeddingServiceError::Configuration(_))
        ));
        assert_eq!(service.state(), ServiceState::Uninitialized);
    }

    #[test]
    fn test_initialize_unreachable_backend_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = Arc::new(BagOfWordsEmbedder::new());
        embedder.set_reachable(false);
        let sink = Arc::new(RecordingSink::default());
        let mut service = EmbeddingService::new(
            test_config(),
            embedder.clone(),
            Arc::new(MemoryDocumentStore::new()),
            EmbeddingStorage::in_dir(dir.path()),
            sink.clone(),
        );

        assert!(matches!(
            service.initialize(),
            Err(EmbeddingServiceError::BackendUnreachable)
        ));
        assert_eq!(service.state(), ServiceState::Uninitialized);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, IndexEvent::GenerationError { .. })));

        embedder.set_reachable(true);
        service.initialize().unwrap();
        assert!(service.is_ready());
    }

    #[test]
    fn test_initialize_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::new());
        store.insert("a.md", "hello world", 1000);
        let embedder = Arc::new(BagOfWordsEmbedder::new());
        let mut service = service_with(store, embedder.clone(), dir.path());

        service.initialize().unwrap();
        let calls = embedder.calls();
        let connections = embedder.connection_tests();

        service.initialize().unwrap();
        assert_eq!(embedder.calls(), calls);
        assert_eq!(embedder.connection_tests(), connections);
    }

    #[test]
    fn test_operations_require_ready() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = service_with(
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(BagOfWordsEmbedder::new()),
            dir.path(),
        );

        assert!(matches!(
            service.regenerate_all(),
            Err(EmbeddingServiceError::NotReady)
        ));
        assert!(matches!(
            service.regenerate_one("a.md"),
            Err(EmbeddingServiceError::NotReady)
        ));
        assert!(matches!(
            service.search("query", None, None),
            Err(EmbeddingServiceError::NotReady)
        ));
    }

    #[test]
    fn test_regenerate_one_propagates_generation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::new());
        let mut service = service_with(
            store.clone(),
            Arc::new(FailingEmbedder::default()),
            dir.path(),
        );
        service.initialize().unwrap();

        store.insert("a.md", "some text", 1000);
        assert!(matches!(
            service.regenerate_one("a.md"),
            Err(EmbeddingServiceError::Generation(_))
        ));
        assert!(service.index().is_empty());
    }

    #[test]
    fn test_failed_update_keeps_previous_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::new());
        store.insert("a.md", "# One\nfirst\n# Two\nsecond", 1000);
        let embedder = Arc::new(BagOfWordsEmbedder::new());
        let mut service = service_with(store.clone(), embedder.clone(), dir.path());
        service.initialize().unwrap();
        assert_eq!(service.index().len(), 2);

        store.insert("a.md", "# One\nchanged\n# Two\nchanged too", 2000);
        embedder.fail_after(1);
        assert!(service.regenerate_one("a.md").is_err());

        let one = service.index().get("a.md#One").unwrap();
        assert_eq!(one.content, "first");
        assert_eq!(service.index().len(), 2);
    }

    #[test]
    fn test_touched_file_refreshes_metadata_without_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::new());
        store.insert("a.md", "stable text", 1000);
        let embedder = Arc::new(BagOfWordsEmbedder::new());
        let mut service = service_with(store.clone(), embedder.clone(), dir.path());
        service.initialize().unwrap();
        let calls = embedder.calls();

        store.insert("a.md", "stable text", 5000);
        let outcome = service.regenerate_one("a.md").unwrap();

        assert_eq!(
            outcome,
            DocumentOutcome::Updated {
                records: 1,
                embedded: 0
            }
        );
        assert_eq!(embedder.calls(), calls);
        assert_eq!(service.index().get("a.md").unwrap().last_modified, 5000);
    }

    #[test]
    fn test_force_regenerate_embeds_unchanged_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::new());
        store.insert("a.md", "stable text", 1000);
        let embedder = Arc::new(BagOfWordsEmbedder::new());
        let mut service = service_with(store, embedder.clone(), dir.path());
        service.initialize().unwrap();
        let calls = embedder.calls();

        assert_eq!(
            service.regenerate_one("a.md").unwrap(),
            DocumentOutcome::Unchanged
        );
        assert_eq!(
            service.force_regenerate("a.md").unwrap(),
            DocumentOutcome::Updated {
                records: 1,
                embedded: 1
            }
        );
        assert_eq!(embedder.calls(), calls + 1);
    }

    #[test]
    fn test_ignored_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::new());
        store.insert("notes/a.md", "kept", 1000);
        store.insert("archive/b.md", "skipped", 1000);
        let mut service = EmbeddingService::new(
            ServiceConfig {
                ignored_folders: vec!["archive".to_string()],
                ..test_config()
            },
            Arc::new(BagOfWordsEmbedder::new()),
            store,
            EmbeddingStorage::in_dir(dir.path()),
            Arc::new(NullSink),
        );
        service.initialize().unwrap();

        assert!(service.index().contains("notes/a.md"));
        assert!(!service.index().contains("archive/b.md"));
        assert_eq!(
            service.regenerate_one("archive/b.md").unwrap(),
            DocumentOutcome::Ignored
        );
    }

    #[test]
    fn test_search_ranks_and_excerpts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::new());
        store.insert("rust.md", "rust borrow checker lifetimes", 1000);
        store.insert("bread.md", "sourdough bread flour water", 1000);
        let mut service = EmbeddingService::new(
            ServiceConfig {
                result_excerpt_chars: 4,
                ..test_config()
            },
            Arc::new(BagOfWordsEmbedder::new()),
            store,
            EmbeddingStorage::in_dir(dir.path()),
            Arc::new(NullSink),
        );
        service.initialize().unwrap();

        let hits = service.search("rust lifetimes", None, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "rust.md");
        assert_eq!(hits[0].excerpt, "rust");
        assert!(hits[0].document.is_live());
        assert!(hits[0].similarity > 0.1);

        assert!(service.search("   ", None, None).unwrap().is_empty());
    }

    #[test]
    fn test_debounced_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::new());
        store.insert("a.md", "hello", 1000);
        let clock = Arc::new(ManualClock::new());
        let mut service = service_with(
            store.clone(),
            Arc::new(BagOfWordsEmbedder::new()),
            dir.path(),
        )
        .with_clock(clock.clone());

        service.initialize().unwrap();
        let cache = EmbeddingStorage::in_dir(dir.path());
        assert!(!cache.exists());

        clock.advance(Duration::from_secs(4));
        service.tick();
        assert!(!cache.exists());

        clock.advance(Duration::from_secs(1));
        service.tick();
        assert!(cache.exists());
        assert!(!service.flush().unwrap());
    }

    #[test]
    fn test_cleanup_flushes_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::new());
        store.insert("a.md", "hello", 1000);
        let mut service = service_with(store, Arc::new(BagOfWordsEmbedder::new()), dir.path());
        service.initialize().unwrap();

        service.cleanup();
        assert_eq!(service.state(), ServiceState::Uninitialized);
        assert!(service.index().is_empty());
        assert!(EmbeddingStorage::in_dir(dir.path()).exists());
    }

    #[test]
    fn test_check_update_model_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::new());
        store.insert("a.md", "hello", 1000);
        let embedder = Arc::new(BagOfWordsEmbedder::new());
        let mut service = service_with(store, embedder.clone(), dir.path());
        service.initialize().unwrap();
        let calls = embedder.calls();

        assert!(!service.check_update_model("nomic-embed-text").unwrap());
        assert!(service.check_update_model("other-model").unwrap());
        assert_eq!(service.model(), "other-model");
        assert!(service.is_ready());
        // old cache was for another model, so everything is embedded again
        assert_eq!(embedder.calls(), calls + 1);
    }
}
