//! Subscription registry — bookkeeping for named logical subscriptions.
//!
//! Every public operation takes the single registry lock for its whole
//! duration, so callers never observe a half-applied mutation. Handle
//! migration after a reconnect is committed the same way: channels are
//! opened on the new connection first, then swapped in under one lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use orderwire_protocol::messages::ChangeEvent;
use tracing::debug;

use crate::error::RegistryError;
use crate::transport::ChannelEventFn;

/// Consumer-facing handle for one logical subscription.
///
/// The handle stays valid across reconnects: the transport channel behind
/// it is swapped transparently, and event delivery resumes on the new
/// connection generation.
#[derive(Clone)]
pub struct Channel {
    name: String,
    created_at: DateTime<Utc>,
    core: Arc<ChannelCore>,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Sets the consumer callback for change events on this channel.
    /// One callback per channel; a later call replaces the earlier one.
    pub fn on_event(&self, cb: impl Fn(ChangeEvent) + Send + Sync + 'static) {
        self.core.set_consumer(Box::new(cb));
    }
}

/// Shared core of a logical channel; outlives any one transport channel.
pub(crate) struct ChannelCore {
    consumer: Mutex<Option<Box<dyn Fn(ChangeEvent) + Send + Sync>>>,
}

impl ChannelCore {
    fn new() -> Self {
        Self {
            consumer: Mutex::new(None),
        }
    }

    fn set_consumer(&self, cb: Box<dyn Fn(ChangeEvent) + Send + Sync>) {
        if let Ok(mut slot) = self.consumer.lock() {
            *slot = Some(cb);
        }
    }

    fn deliver(&self, event: ChangeEvent) {
        if let Ok(slot) = self.consumer.lock()
            && let Some(cb) = slot.as_ref()
        {
            cb(event);
        }
    }

    /// Adapter handed to the transport when (re)opening the underlying
    /// channel; routes transport events into the consumer callback.
    pub(crate) fn event_fn(self: &Arc<Self>) -> ChannelEventFn {
        let core = self.clone();
        Arc::new(move |event| core.deliver(event))
    }
}

/// Outcome of a `register` call.
pub(crate) enum Registered {
    /// A fresh entry was created; the transport channel is not attached yet.
    New(Channel),
    /// The name already had a live entry; no second slot was consumed.
    Existing(Channel),
}

impl Registered {
    pub(crate) fn into_channel(self) -> Channel {
        match self {
            Registered::New(ch) | Registered::Existing(ch) => ch,
        }
    }
}

struct Entry<H> {
    core: Arc<ChannelCore>,
    handle: Option<H>,
    created_at: DateTime<Utc>,
}

struct Inner<H> {
    entries: HashMap<String, Entry<H>>,
    total_created: u64,
}

/// Table of named logical subscriptions with a hard active ceiling.
pub(crate) struct SubscriptionRegistry<H> {
    limit: usize,
    inner: Mutex<Inner<H>>,
}

impl<H: Clone> SubscriptionRegistry<H> {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                total_created: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<H>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a name. Idempotent: an existing entry is returned as-is
    /// and does not count against the limit a second time. A new name at
    /// the ceiling fails without mutating anything.
    pub(crate) fn register(&self, name: &str) -> Result<Registered, RegistryError> {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get(name) {
            return Ok(Registered::Existing(Channel {
                name: name.to_string(),
                created_at: entry.created_at,
                core: entry.core.clone(),
            }));
        }
        if inner.entries.len() >= self.limit {
            return Err(RegistryError::LimitExceeded { limit: self.limit });
        }
        let core = Arc::new(ChannelCore::new());
        let created_at = Utc::now();
        inner.entries.insert(
            name.to_string(),
            Entry {
                core: core.clone(),
                handle: None,
                created_at,
            },
        );
        inner.total_created += 1;
        debug!(channel = %name, active = inner.entries.len(), "subscription registered");
        Ok(Registered::New(Channel {
            name: name.to_string(),
            created_at,
            core,
        }))
    }

    /// Removes a name. Returns the detached transport handle when the
    /// entry existed, `None` when the name was never registered.
    pub(crate) fn unregister(&self, name: &str) -> Option<Option<H>> {
        let mut inner = self.lock();
        let entry = inner.entries.remove(name)?;
        debug!(channel = %name, active = inner.entries.len(), "subscription removed");
        Some(entry.handle)
    }

    /// Attaches a freshly opened transport channel to an entry. Returns
    /// `false` when the entry was unregistered in the meantime.
    pub(crate) fn attach(&self, name: &str, handle: H) -> bool {
        let mut inner = self.lock();
        match inner.entries.get_mut(name) {
            Some(entry) => {
                entry.handle = Some(handle);
                true
            }
            None => false,
        }
    }

    /// Drops every transport handle (the connection is gone) while
    /// keeping all names registered for replay.
    pub(crate) fn detach_all(&self) {
        let mut inner = self.lock();
        for entry in inner.entries.values_mut() {
            entry.handle = None;
        }
    }

    /// Snapshot of `(name, core)` pairs that are still waiting for a
    /// transport channel. Used to open channels after (re)connecting.
    pub(crate) fn detached_cores(&self) -> Vec<(String, Arc<ChannelCore>)> {
        self.lock()
            .entries
            .iter()
            .filter(|(_, entry)| entry.handle.is_none())
            .map(|(name, entry)| (name.clone(), entry.core.clone()))
            .collect()
    }

    /// Core of a registered entry, but only while no transport channel is
    /// attached yet. `None` once attached or unregistered, so two openers
    /// racing for the same name cannot both proceed.
    pub(crate) fn core_if_detached(&self, name: &str) -> Option<Arc<ChannelCore>> {
        self.lock()
            .entries
            .get(name)
            .filter(|e| e.handle.is_none())
            .map(|e| e.core.clone())
    }

    /// Swaps in handles from a new connection generation in one locked
    /// commit. Names unregistered since the snapshot are skipped.
    pub(crate) fn migrate(&self, handles: Vec<(String, H)>) {
        let mut inner = self.lock();
        for (name, handle) in handles {
            if let Some(entry) = inner.entries.get_mut(&name) {
                entry.handle = Some(handle);
            }
        }
    }

    pub(crate) fn active_count(&self) -> usize {
        self.lock().entries.len()
    }

    pub(crate) fn total_created(&self) -> u64 {
        self.lock().total_created
    }

    pub(crate) fn active_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Removes every entry. Teardown only.
    pub(crate) fn clear(&self) {
        self.lock().entries.clear();
    }
}
