//! Snapshot subscriptions.
//!
//! Two ways to observe a machine: callbacks registered with `subscribe`,
//! called synchronously after each quiescent step, and a tokio broadcast
//! stream for async consumers.

use crate::snapshot::Snapshot;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

/// Callback invoked with each published snapshot.
pub type SnapshotCallback = Arc<dyn Fn(&Arc<Snapshot>) + Send + Sync>;

/// Fans snapshots out to callbacks and broadcast receivers.
pub struct SnapshotBroadcaster {
    /// Registered callbacks by subscription id.
    callbacks: DashMap<String, SnapshotCallback>,

    /// Stream for async consumers.
    sender: broadcast::Sender<Arc<Snapshot>>,
}

impl SnapshotBroadcaster {
    /// Creates a broadcaster whose stream buffers `channel_capacity` snapshots.
    pub fn new(channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            callbacks: DashMap::new(),
            sender,
        }
    }

    /// Registers a callback.
    pub fn subscribe(self: &Arc<Self>, callback: SnapshotCallback) -> Subscription {
        let id = format!("sub-{}", uuid::Uuid::new_v4());
        self.callbacks.insert(id.clone(), callback);
        Subscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    /// Returns a receiver for subsequently published snapshots.
    pub fn subscribe_stream(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.sender.subscribe()
    }

    /// Publishes a snapshot.
    ///
    /// Callbacks are collected first and invoked outside the map, so a
    /// callback may subscribe or unsubscribe without deadlocking.
    pub fn notify(&self, snapshot: &Arc<Snapshot>) {
        let callbacks: Vec<SnapshotCallback> =
            self.callbacks.iter().map(|entry| Arc::clone(entry.value())).collect();
        for callback in callbacks {
            callback(snapshot);
        }

        // Ignore send errors (no receivers)
        let _ = self.sender.send(Arc::clone(snapshot));
    }

    fn remove(&self, id: &str) -> bool {
        self.callbacks.remove(id).is_some()
    }

    /// Drops every callback.
    pub fn clear(&self) {
        self.callbacks.clear();
    }

    pub fn subscription_count(&self) -> usize {
        self.callbacks.len()
    }
}

impl std::fmt::Debug for SnapshotBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotBroadcaster")
            .field("subscriptions", &self.callbacks.len())
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

/// Handle returned by `subscribe`. Dropping it does not unsubscribe.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: String,
    registry: Weak<SnapshotBroadcaster>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Removes the callback. Calling it again, or after the actor is gone,
    /// does nothing.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(&self.id) {
                tracing::debug!(subscription_id = %self.id, "Unsubscribed");
            }
        }
    }
}
