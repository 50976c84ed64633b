//! Index events and the sink they are delivered through.
//!
//! The service is handed an [`EventSink`]; [`EventBus`] is the default sink
//! and fans events out to subscribers, each removable through its own
//! [`Subscription`] handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;

use crate::semantic::progress::{IndexStats, ProgressState};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IndexEvent {
    #[serde(rename_all = "camelCase")]
    StatsUpdated {
        progress: ProgressState,
        stats: IndexStats,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    GenerationStarted {
        progress: ProgressState,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    GenerationCompleted {
        progress: ProgressState,
        stats: IndexStats,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    GenerationError { error: String, timestamp: i64 },
    #[serde(rename_all = "camelCase")]
    ServiceInitialized { stats: IndexStats, timestamp: i64 },
    #[serde(rename_all = "camelCase")]
    FileProcessed { path: String, success: bool },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &IndexEvent);
}

/// Sink that drops every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &IndexEvent) {}
}

type Handler = Arc<dyn Fn(&IndexEvent) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<Vec<(SubscriptionId, Handler)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a handler. It stays registered until the returned handle is
    /// unsubscribed or dropped.
    pub fn subscribe<F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(&IndexEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        match self.handlers.lock() {
            Ok(mut handlers) => handlers.push((id, Arc::new(handler))),
            Err(e) => log::error!("event bus lock poisoned: {e}"),
        }

        Subscription {
            id,
            bus: Arc::downgrade(self),
        }
    }

    /// Remove a handler. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Ok(mut handlers) = self.handlers.lock() else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().map(|h| h.len()).unwrap_or(0)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: &IndexEvent) {
        // handlers run outside the lock so they may (un)subscribe
        let handlers: Vec<Handler> = match self.handlers.lock() {
            Ok(handlers) => handlers.iter().map(|(_, h)| h.clone()).collect(),
            Err(e) => {
                log::error!("event bus lock poisoned: {e}");
                return;
            }
        };

        for handler in handlers {
            handler(event);
        }
    }
}

/// Handle returned by [`EventBus::subscribe`]. Dropping it unsubscribes.
#[must_use = "the handler is removed when the subscription is dropped"]
pub struct Subscription {
    id: SubscriptionId,
    bus: Weak<EventBus>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Stop receiving events. Returns false if the bus is gone or the handler
    /// was already removed.
    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.unsubscribe(self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}
