//! Semantic indexing engine for markdown notes.
//!
//! # Architecture
//!
//! - `preprocess`: markup stripping and content hashing
//! - `change`: decides whether a note or section needs re-embedding
//! - `index`: in-memory vector index with cosine similarity search
//! - `codec`: packed float32 <-> base64 vector encoding
//! - `storage`: JSON cache file and debounced saves
//! - `embeddings` / `ollama`: embedding backends
//! - `progress` / `events`: batch counters and notifications
//! - `service`: the index state machine tying it all together
//! - `watcher`: debounced routing of document lifecycle events

mod change;
pub mod clock;
mod codec;
pub mod embeddings;
pub mod events;
mod index;
pub mod ollama;
mod preprocess;
mod progress;
mod service;
mod storage;
mod watcher;

pub use embeddings::Embedder;
pub use events::{EventBus, IndexEvent, Subscription};
pub use index::VectorIndex;
pub use ollama::OllamaClient;
pub use progress::IndexStats;
pub use service::{EmbeddingService, ServiceConfig};
pub use storage::EmbeddingStorage;
pub use watcher::{ChangeWatcherAdapter, DocumentEvent};

#[cfg(test)]
pub use events::NullSink;
#[cfg(test)]
pub use service::{DocumentOutcome, EmbeddingServiceError, ServiceState, SyncSummary};

#[cfg(feature = "local-embeddings")]
pub use embeddings::LocalEmbedder;

/// Default embedding model name
pub const DEFAULT_MODEL: &str = "nomic-embed-text";
