//! Synchronous change observers for base relations.
//!
//! Every base relation owns an `ObserverRegistry`. Mutations notify the
//! registered callbacks with the precise `RelationChange` as they happen.
//! Registration hands back an opaque removal handle; observers are keyed by
//! monotonically increasing 64-bit IDs so deregistration is deterministic.

use crate::change::RelationChange;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Unique identifier for a registered observer.
pub type ObserverId = u64;

/// Callback type for synchronous change notifications.
pub type ChangeCallback = Arc<dyn Fn(&RelationChange) + Send + Sync>;

struct RegistryInner {
    observers: Mutex<HashMap<ObserverId, ChangeCallback>>,
    next_id: AtomicU64,
}

/// A registry of synchronous change observers.
pub struct ObserverRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                observers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers a callback and returns its removal handle.
    pub fn observe<F>(&self, callback: F) -> ObserverRemoval
    where
        F: Fn(&RelationChange) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.observers.lock().insert(id, Arc::new(callback));
        ObserverRemoval {
            registry: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Notifies every registered observer of a change.
    ///
    /// Callbacks run outside the registry lock so they may register or
    /// remove observers reentrantly.
    pub fn notify(&self, change: &RelationChange) {
        let callbacks: Vec<ChangeCallback> =
            self.inner.observers.lock().values().cloned().collect();
        for callback in callbacks {
            callback(change);
        }
    }

    /// Returns the number of registered observers.
    pub fn len(&self) -> usize {
        self.inner.observers.lock().len()
    }

    /// Returns true if no observers are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.observers.lock().is_empty()
    }
}

/// Opaque handle that detaches an observer when invoked.
///
/// Dropping the handle without calling `remove` leaves the observer
/// registered for the lifetime of the relation.
pub struct ObserverRemoval {
    registry: Weak<RegistryInner>,
    id: ObserverId,
}

impl ObserverRemoval {
    /// Detaches the observer. Returns true if it was still registered.
    pub fn remove(self) -> bool {
        match self.registry.upgrade() {
            Some(inner) => inner.observers.lock().remove(&self.id).is_some(),
            None => false,
        }
    }
}
