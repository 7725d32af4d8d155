//! Store change notifications.
//!
//! Subscribers are plain callbacks invoked synchronously, on the task that
//! caused the change, in registration order. A callback may subscribe or
//! unsubscribe from inside a notification; the change applies from the next
//! event on.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOperation {
    Create,
    Update,
    Delete,
    /// Server data merged into the store.
    Merge,
    /// Server tombstone removed a local record.
    RemoteDelete,
    /// A conflict was detected (and, except for `manual`, resolved).
    Conflict,
    ConflictResolved,
    SyncComplete,
    SyncError,
    Import,
    Clear,
}

/// A change notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreEvent {
    pub store: String,
    pub operation: StoreOperation,
    pub data: Value,
}

/// Handle returned by `subscribe`, for `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, Callback)>,
}

#[derive(Default)]
pub(crate) struct Subscribers {
    registry: Mutex<Registry>,
}

impl Subscribers {
    pub fn subscribe(&self, callback: Callback) -> SubscriptionId {
        let Ok(mut registry) = self.registry.lock() else {
            return SubscriptionId(u64::MAX);
        };
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry.subscribers.push((id, callback));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Ok(mut registry) = self.registry.lock() else {
            return false;
        };
        let before = registry.subscribers.len();
        registry.subscribers.retain(|(sid, _)| *sid != id);
        registry.subscribers.len() != before
    }

    pub fn emit(&self, event: &StoreEvent) {
        // Callbacks run outside the lock so they may (un)subscribe.
        let callbacks: Vec<Callback> = match self.registry.lock() {
            Ok(registry) => registry.subscribers.iter().map(|(_, c)| Arc::clone(c)).collect(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.registry.lock().map_or(0, |r| r.subscribers.len())
    }
}
