//! The event dispatch bus.
//!
//! In-process publish/subscribe router. Listeners are keyed by event name and
//! kept in registration order; publishing serializes the event once, spawns
//! one task per listener, and never waits for any of them; a publisher is
//! guaranteed to keep running before its subscribers get a turn.
//!
//! Listener failures never reach the publisher. Under error isolation
//! (the default) a failure is logged and republished as an [`ErrorEvent`];
//! that republication runs *without* isolation, so a faulty error listener is
//! only logged and an infinite error-event loop is impossible.

use crate::events::{ErrorEvent, Event, EventError};
use crate::listener::{AsyncTypedListener, EventListener, TypedListener};
use compact_str::CompactString;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

// ============================================================================
// Listener Identity
// ============================================================================

/// Identity handed back by registration, used to unregister later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone)]
struct ListenerEntry {
    id: ListenerId,
    listener: Arc<dyn EventListener>,
}

// ============================================================================
// Bus
// ============================================================================

/// Snapshot of bus throughput counters.
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    /// Events handed to `publish`/`publish_with`
    pub events_published: u64,
    /// Listener invocations that completed successfully
    pub listeners_invoked: u64,
    /// Listener invocations that failed
    pub listener_failures: u64,
}

#[derive(Default)]
struct BusCounters {
    published: AtomicU64,
    invoked: AtomicU64,
    failed: AtomicU64,
}

/// The in-process publish/subscribe router.
///
/// Cheap to clone; every clone shares the same listener table and counters.
/// Uses DashMap for lock-free concurrent access to the listener lists.
#[derive(Clone)]
pub struct EventBus {
    listeners: Arc<DashMap<CompactString, Vec<ListenerEntry>>>,
    counters: Arc<BusCounters>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("event_names", &self.listeners.len())
            .finish()
    }
}

impl EventBus {
    /// Creates a new bus with no registered listeners.
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            counters: Arc::new(BusCounters::default()),
        }
    }

    /// Registers a sync closure for events of type `T`.
    ///
    /// Duplicate registrations are kept and invoked once each, in
    /// registration order.
    pub fn register<T, F>(&self, handler: F) -> ListenerId
    where
        T: Event,
        F: Fn(T) -> Result<(), EventError> + Send + Sync + 'static,
    {
        let name = format!("{}_listener", T::NAME);
        self.register_raw(T::NAME, Arc::new(TypedListener::new(name, handler)))
    }

    /// Registers an async closure for events of type `T`.
    pub fn register_async<T, F, Fut>(&self, handler: F) -> ListenerId
    where
        T: Event,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EventError>> + Send + 'static,
    {
        let name = format!("{}_listener", T::NAME);
        self.register_raw(T::NAME, Arc::new(AsyncTypedListener::new(name, handler)))
    }

    /// Registers a pre-built listener under an explicit event name.
    ///
    /// This is the seam the remote-forwarding path uses: it subscribes by
    /// name string and wants the payload bytes untouched.
    pub fn register_raw(&self, event_name: &str, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId::new();
        debug!(
            "📝 Registered listener '{}' for '{}'",
            listener.listener_name(),
            event_name
        );
        self.listeners
            .entry(CompactString::new(event_name))
            .or_default()
            .push(ListenerEntry { id, listener });
        id
    }

    /// Removes the registration `id` made under `event_name`.
    ///
    /// Removes the first match only; returns `false` when no such
    /// registration exists. An emptied listener list drops its table entry.
    pub fn unregister(&self, event_name: &str, id: ListenerId) -> bool {
        let removed = {
            let Some(mut entry) = self.listeners.get_mut(event_name) else {
                return false;
            };
            match entry.iter().position(|candidate| candidate.id == id) {
                Some(position) => {
                    entry.remove(position);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.listeners.remove_if(event_name, |_, list| list.is_empty());
        }
        removed
    }

    /// Publishes with error isolation (the default).
    pub fn publish<T: Event>(&self, event: &T) -> Result<(), EventError> {
        self.publish_with(event, true)
    }

    /// Publishes `event` to every listener registered for `T::NAME`.
    ///
    /// Serializes once, snapshots the listener list, spawns one task per
    /// listener in registration order, and returns without awaiting anything.
    /// Publishing a variant nobody listens to is a silent no-op.
    pub fn publish_with<T: Event>(&self, event: &T, isolate_errors: bool) -> Result<(), EventError> {
        let payload: Arc<[u8]> = event.encode()?.into();
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        let event_name = T::NAME;

        let snapshot = match self.listeners.get(event_name) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!("📭 No listeners for '{}'", event_name);
                return Ok(());
            }
        };

        debug!(
            "📤 Publishing '{}' to {} listeners",
            event_name,
            snapshot.len()
        );

        for entry in snapshot {
            let bus = self.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                match entry.listener.handle(&payload).await {
                    Ok(()) => {
                        bus.counters.invoked.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        bus.counters.failed.fetch_add(1, Ordering::Relaxed);
                        error!(
                            "❌ Listener '{}' failed handling '{}': {}",
                            entry.listener.listener_name(),
                            event_name,
                            err
                        );
                        if isolate_errors {
                            let report = ErrorEvent::from_error(&err);
                            if let Err(publish_err) = bus.publish_with(&report, false) {
                                error!("❌ Could not publish error event: {}", publish_err);
                            }
                        }
                    }
                }
            });
        }

        Ok(())
    }

    /// Number of listeners currently registered for `event_name`.
    pub fn listener_count(&self, event_name: &str) -> usize {
        self.listeners
            .get(event_name)
            .map(|entry| entry.value().len())
            .unwrap_or(0)
    }

    /// Names that currently have at least one listener.
    pub fn registered_events(&self) -> Vec<String> {
        self.listeners
            .iter()
            .map(|entry| entry.key().to_string())
            .collect()
    }

    /// Current throughput counters.
    pub fn stats(&self) -> BusStats {
        BusStats {
            events_published: self.counters.published.load(Ordering::Relaxed),
            listeners_invoked: self.counters.invoked.load(Ordering::Relaxed),
            listener_failures: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
