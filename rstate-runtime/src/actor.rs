//! Actor handles.

use crate::snapshot::Snapshot;
use crate::subscription::{SnapshotCallback, Subscription};
use rstate_core::Event;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

/// Lifecycle of an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorStatus {
    /// Created; events are buffered in the mailbox.
    NotStarted,
    /// Processing events.
    Active,
    /// Stopped or finished. Events are ignored.
    Stopped,
    /// Failed. Events are ignored.
    Errored,
}

impl ActorStatus {
    /// Whether the actor can no longer process events.
    pub fn is_terminal(self) -> bool {
        matches!(self, ActorStatus::Stopped | ActorStatus::Errored)
    }
}

/// Behavior shared by machine and task actors.
pub(crate) trait ActorCell: Send + Sync {
    fn id(&self) -> &str;
    fn session_id(&self) -> &str;
    fn status(&self) -> ActorStatus;
    fn send(&self, event: Event);
    fn start(&self);
    fn stop(&self);
    fn snapshot(&self) -> Option<Arc<Snapshot>>;
    fn subscribe(&self, callback: SnapshotCallback) -> Option<Subscription>;
}

/// Cloneable handle to a running actor.
///
/// Sending to a stopped actor through a stale reference is a no-op.
#[derive(Clone)]
pub struct ActorRef {
    inner: Arc<dyn ActorCell>,
}

impl ActorRef {
    pub(crate) fn new(inner: Arc<dyn ActorCell>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    /// Unique id of this actor instance.
    pub fn session_id(&self) -> &str {
        self.inner.session_id()
    }

    pub fn status(&self) -> ActorStatus {
        self.inner.status()
    }

    pub fn send(&self, event: impl Into<Event>) {
        self.inner.send(event.into());
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    pub(crate) fn start(&self) {
        self.inner.start();
    }

    /// Latest snapshot. Task actors have none.
    pub fn get_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.inner.snapshot()
    }

    /// Subscribes to snapshots of a machine actor. Returns `None` for task actors.
    pub fn subscribe<F>(&self, callback: F) -> Option<Subscription>
    where
        F: Fn(&Arc<Snapshot>) + Send + Sync + 'static,
    {
        self.inner.subscribe(Arc::new(callback))
    }
}

impl PartialEq for ActorRef {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

impl fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef")
            .field("id", &self.id())
            .field("session_id", &self.session_id())
            .field("status", &self.status())
            .finish()
    }
}

impl Serialize for ActorRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ActorRef", 2)?;
        state.serialize_field("id", self.id())?;
        state.serialize_field("session_id", self.session_id())?;
        state.end()
    }
}
