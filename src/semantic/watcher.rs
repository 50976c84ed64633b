//! Routes document lifecycle events into the embedding service.
//!
//! Creates and modifications go through a per-path leading-edge debounce:
//! the first event regenerates immediately, later events inside the window
//! are coalesced into one trailing regeneration when the window closes.
//! Deletes are applied at once. A rename evicts the old path and is then
//! treated as a modification of the new one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::notes::DocumentStoreError;
use crate::semantic::clock::Clock;
use crate::semantic::service::{EmbeddingService, EmbeddingServiceError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DocumentEvent {
    Created(String),
    Modified(String),
    Deleted(String),
    Renamed { path: String, old_path: String },
}

#[derive(Debug)]
struct Window {
    opened_at: Instant,
    /// An event arrived while the window was open
    suppressed: bool,
}

/// Per-key leading-edge debounce table.
#[derive(Debug)]
pub struct Debouncer<K> {
    window: Duration,
    entries: BTreeMap<K, Window>,
}

impl<K: Ord + Clone> Debouncer<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: BTreeMap::new(),
        }
    }

    /// Register an event for `key`. Returns true when the caller should act
    /// now; false when the event was folded into an open window.
    pub fn trigger(&mut self, key: K, now: Instant) -> bool {
        match self.entries.get_mut(&key) {
            Some(entry) if now.saturating_duration_since(entry.opened_at) < self.window => {
                entry.suppressed = true;
                false
            }
            _ => {
                self.entries.insert(
                    key,
                    Window {
                        opened_at: now,
                        suppressed: false,
                    },
                );
                true
            }
        }
    }

    /// Keys owed a trailing action, in key order.
    ///
    /// Closed windows without suppressed events are forgotten. Returned keys
    /// start a fresh window.
    pub fn take_due(&mut self, now: Instant) -> Vec<K> {
        let window = self.window;
        let mut due = Vec::new();

        self.entries.retain(|key, entry| {
            if now.saturating_duration_since(entry.opened_at) < window {
                return true;
            }
            if entry.suppressed {
                due.push(key.clone());
                entry.opened_at = now;
                entry.suppressed = false;
                true
            } else {
                false
            }
        });

        due
    }

    /// Drop any window for `key`. Returns whether one existed.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn has_pending(&self, key: &K) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.suppressed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct ChangeWatcherAdapter {
    debouncer: Debouncer<String>,
    clock: Arc<dyn Clock>,
}

impl ChangeWatcherAdapter {
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            debouncer: Debouncer::new(window),
            clock,
        }
    }

    pub fn debouncer(&self) -> &Debouncer<String> {
        &self.debouncer
    }

    /// Apply one event. Ignored until the service is ready.
    pub fn handle(
        &mut self,
        service: &mut EmbeddingService,
        event: DocumentEvent,
    ) -> Result<(), EmbeddingServiceError> {
        if !service.is_ready() {
            log::debug!("ignoring {event:?}, embedding service not ready");
            return Ok(());
        }

        match event {
            DocumentEvent::Created(path) | DocumentEvent::Modified(path) => {
                self.schedule(service, path)
            }
            DocumentEvent::Deleted(path) => {
                self.debouncer.cancel(&path);
                service.remove_for_document(&path);
                Ok(())
            }
            DocumentEvent::Renamed { path, old_path } => {
                self.debouncer.cancel(&old_path);
                service.remove_for_document(&old_path);
                self.schedule(service, path)
            }
        }
    }

    /// Run trailing regenerations whose window closed, then any due save.
    ///
    /// Returns the paths that failed to regenerate.
    pub fn tick(&mut self, service: &mut EmbeddingService) -> Vec<(String, EmbeddingServiceError)> {
        if !service.is_ready() {
            return Vec::new();
        }

        let mut failures = Vec::new();
        for path in self.debouncer.take_due(self.clock.now()) {
            if let Err(e) = refresh(service, &path) {
                failures.push((path, e));
            }
        }
        service.tick();

        failures
    }

    fn schedule(
        &mut self,
        service: &mut EmbeddingService,
        path: String,
    ) -> Result<(), EmbeddingServiceError> {
        if self.debouncer.trigger(path.clone(), self.clock.now()) {
            refresh(service, &path)
        } else {
            log::debug!("coalescing change to {path}");
            Ok(())
        }
    }
}

/// Regenerate `path`; a note that vanished in the meantime is evicted.
fn refresh(service: &mut EmbeddingService, path: &str) -> Result<(), EmbeddingServiceError> {
    match service.regenerate_one(path) {
        Ok(outcome) => {
            log::debug!("{path}: {outcome:?}");
            Ok(())
        }
        Err(EmbeddingServiceError::Document(DocumentStoreError::NotFound(_))) => {
            service.remove_for_document(path);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
