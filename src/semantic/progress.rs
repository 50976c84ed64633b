//! Generation progress and index statistics.

use std::sync::Arc;

use serde::Serialize;

use crate::semantic::events::{EventSink, IndexEvent};
use crate::semantic::index::VectorIndex;

/// Counters of the running (or last) batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub total: usize,
    pub processed: usize,
    pub errors: usize,
    pub is_running: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub total_embeddings: usize,
    pub total_files: usize,
    pub average_sections_per_file: f64,
    pub embedding_dimensions: usize,
    pub disk_usage_estimate: String,
}

impl IndexStats {
    pub fn from_index(index: &VectorIndex) -> Self {
        let total_embeddings = index.len();
        let total_files = index.document_paths().len();
        let embedding_dimensions = index.dimensions();
        let bytes = (total_embeddings * embedding_dimensions * std::mem::size_of::<f32>()) as u64;

        Self {
            total_embeddings,
            total_files,
            average_sections_per_file: if total_files > 0 {
                total_embeddings as f64 / total_files as f64
            } else {
                0.0
            },
            embedding_dimensions,
            disk_usage_estimate: format_size(bytes),
        }
    }
}

/// Format a byte count with binary prefixes, e.g. `1.5 kB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 7] = ["B", "kB", "MB", "GB", "TB", "PB", "EB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, UNITS[unit])
}

/// Tracks batch counters and emits coalesced notifications.
///
/// A stats update is emitted when a batch starts, every `emit_every`
/// documents, and when it ends.
pub struct ProgressReporter {
    state: ProgressState,
    sink: Arc<dyn EventSink>,
    emit_every: usize,
}

impl ProgressReporter {
    pub fn new(sink: Arc<dyn EventSink>, emit_every: usize) -> Self {
        Self {
            state: ProgressState::default(),
            sink,
            emit_every: emit_every.max(1),
        }
    }

    pub fn state(&self) -> ProgressState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running
    }

    pub fn begin(&mut self, total: usize, stats: IndexStats) {
        self.state = ProgressState {
            total,
            processed: 0,
            errors: 0,
            is_running: true,
        };
        self.emit_stats(stats);
        self.sink.emit(&IndexEvent::GenerationStarted {
            progress: self.state,
            timestamp: now_millis(),
        });
    }

    /// Count a document that finished without error.
    ///
    /// `regenerated` is false for documents skipped as unchanged; those do
    /// not produce a file notification.
    pub fn record_success<F>(&mut self, path: &str, regenerated: bool, stats: F)
    where
        F: FnOnce() -> IndexStats,
    {
        self.state.processed += 1;
        if regenerated {
            self.file_processed(path, true);
        }
        self.maybe_emit(stats);
    }

    /// Count a failed document.
    pub fn record_error<F>(&mut self, path: &str, stats: F)
    where
        F: FnOnce() -> IndexStats,
    {
        self.state.processed += 1;
        self.state.errors += 1;
        self.file_processed(path, false);
        self.maybe_emit(stats);
    }

    /// Per-document notification without touching the batch counters.
    pub fn file_processed(&self, path: &str, success: bool) {
        self.sink.emit(&IndexEvent::FileProcessed {
            path: path.to_string(),
            success,
        });
    }

    pub fn finish(&mut self, stats: IndexStats) {
        self.state.is_running = false;
        self.emit_stats(stats.clone());
        if self.state.total > 0 {
            self.sink.emit(&IndexEvent::GenerationCompleted {
                progress: self.state,
                stats,
                timestamp: now_millis(),
            });
        }
    }

    /// End the batch early, reporting `error` instead of a completion.
    pub fn abort(&mut self, stats: IndexStats, error: &str) {
        self.state.is_running = false;
        self.emit_stats(stats);
        self.fail(error);
    }

    pub fn fail(&self, error: &str) {
        self.sink.emit(&IndexEvent::GenerationError {
            error: error.to_string(),
            timestamp: now_millis(),
        });
    }

    pub fn reset(&mut self) {
        self.state = ProgressState::default();
    }

    pub fn emit_stats(&self, stats: IndexStats) {
        self.sink.emit(&IndexEvent::StatsUpdated {
            progress: self.state,
            stats,
            timestamp: now_millis(),
        });
    }

    pub fn emit_initialized(&self, stats: IndexStats) {
        self.sink.emit(&IndexEvent::ServiceInitialized {
            stats,
            timestamp: now_millis(),
        });
    }

    fn maybe_emit<F>(&self, stats: F)
    where
        F: FnOnce() -> IndexStats,
    {
        if self.state.processed % self.emit_every == 0 {
            self.emit_stats(stats());
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
