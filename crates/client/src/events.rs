//! Event dispatcher — observer lists for state, quality and error events.
//!
//! Listeners are kept in per-kind lists keyed by a generated id, so a
//! [`ListenerHandle`] removes exactly its own registration. Delivery is
//! synchronous and in registration order; a dedicated delivery lock keeps
//! notifications from interleaving out of order across tasks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

use crate::types::{ConnectionState, ErrorEvent, QualityLevel};

type StateFn = Arc<dyn Fn(ConnectionState) + Send + Sync>;
type QualityFn = Arc<dyn Fn(QualityLevel) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&ErrorEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerKind {
    State,
    Quality,
    Error,
}

/// Fan-out point for manager notifications.
pub struct EventDispatcher {
    next_id: AtomicU64,
    state: Mutex<Vec<(u64, StateFn)>>,
    quality: Mutex<Vec<(u64, QualityFn)>>,
    error: Mutex<Vec<(u64, ErrorFn)>>,
    /// Held while invoking callbacks so concurrent emitters cannot
    /// deliver a later transition before an earlier one.
    delivery: Mutex<()>,
}

impl EventDispatcher {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(Vec::new()),
            quality: Mutex::new(Vec::new()),
            error: Mutex::new(Vec::new()),
            delivery: Mutex::new(()),
        }
    }

    /// Registers a connection-state listener.
    pub fn on_state_change(
        self: &Arc<Self>,
        cb: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut list) = self.state.lock() {
            list.push((id, Arc::new(cb)));
        }
        self.handle(ListenerKind::State, id)
    }

    /// Registers a quality listener.
    pub fn on_quality_change(
        self: &Arc<Self>,
        cb: impl Fn(QualityLevel) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut list) = self.quality.lock() {
            list.push((id, Arc::new(cb)));
        }
        self.handle(ListenerKind::Quality, id)
    }

    /// Registers an error listener.
    pub fn on_error(
        self: &Arc<Self>,
        cb: impl Fn(&ErrorEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut list) = self.error.lock() {
            list.push((id, Arc::new(cb)));
        }
        self.handle(ListenerKind::Error, id)
    }

    pub(crate) fn emit_state(&self, state: ConnectionState) {
        let listeners: Vec<StateFn> = match self.state.lock() {
            Ok(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
            Err(_) => return,
        };
        let _guard = self.delivery.lock();
        trace!(?state, listeners = listeners.len(), "emit state change");
        for cb in listeners {
            cb(state);
        }
    }

    pub(crate) fn emit_quality(&self, quality: QualityLevel) {
        let listeners: Vec<QualityFn> = match self.quality.lock() {
            Ok(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
            Err(_) => return,
        };
        let _guard = self.delivery.lock();
        trace!(?quality, listeners = listeners.len(), "emit quality change");
        for cb in listeners {
            cb(quality);
        }
    }

    pub(crate) fn emit_error(&self, event: ErrorEvent) {
        let listeners: Vec<ErrorFn> = match self.error.lock() {
            Ok(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
            Err(_) => return,
        };
        let _guard = self.delivery.lock();
        for cb in listeners {
            cb(&event);
        }
    }

    /// Drops every listener. Called at the end of manager teardown so
    /// nothing fires afterwards.
    pub(crate) fn clear(&self) {
        if let Ok(mut list) = self.state.lock() {
            list.clear();
        }
        if let Ok(mut list) = self.quality.lock() {
            list.clear();
        }
        if let Ok(mut list) = self.error.lock() {
            list.clear();
        }
    }

    fn handle(self: &Arc<Self>, kind: ListenerKind, id: u64) -> ListenerHandle {
        ListenerHandle {
            dispatcher: Arc::downgrade(self),
            kind,
            id,
            removed: AtomicBool::new(false),
        }
    }

    fn remove(&self, kind: ListenerKind, id: u64) {
        match kind {
            ListenerKind::State => {
                if let Ok(mut list) = self.state.lock() {
                    list.retain(|(i, _)| *i != id);
                }
            }
            ListenerKind::Quality => {
                if let Ok(mut list) = self.quality.lock() {
                    list.retain(|(i, _)| *i != id);
                }
            }
            ListenerKind::Error => {
                if let Ok(mut list) = self.error.lock() {
                    list.retain(|(i, _)| *i != id);
                }
            }
        }
    }
}

/// Disposable handle for a registered listener.
///
/// Dropping the handle does **not** remove the listener; only an explicit
/// [`unsubscribe`](Self::unsubscribe) does, and calling it again is a no-op.
pub struct ListenerHandle {
    dispatcher: Weak<EventDispatcher>,
    kind: ListenerKind,
    id: u64,
    removed: AtomicBool,
}

impl ListenerHandle {
    /// Removes exactly this registration. Idempotent.
    pub fn unsubscribe(&self) {
        if self.removed.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.remove(self.kind, self.id);
        }
    }
}
