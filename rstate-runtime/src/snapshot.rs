//! Immutable snapshots of a machine actor.

use crate::actor::ActorRef;
use rstate_core::{MachineDefinition, MachineState, StateValue, Status};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Published state of a machine actor after a quiescent step.
///
/// Serializes as:
///
/// ```json
/// {
///   "value": {"upload": "done", "download": "running"},
///   "context": {"retries": 0},
///   "children": {"fetch": {"id": "fetch", "session_id": "…"}},
///   "status": "active",
///   "event": "PROGRESS"
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub value: StateValue,
    pub context: Arc<Value>,
    pub children: BTreeMap<String, ActorRef>,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Type of the last event that caused a microstep.
    pub event: String,
}

impl Snapshot {
    pub(crate) fn new(
        def: &MachineDefinition,
        state: &MachineState,
        children: BTreeMap<String, ActorRef>,
    ) -> Self {
        Self {
            value: state.value(def),
            context: Arc::clone(&state.context),
            children,
            status: state.status,
            output: state.output.clone(),
            error: state.error.clone(),
            event: state.event.event_type.clone(),
        }
    }

    /// Returns true if the dotted state path is active.
    pub fn matches(&self, path: &str) -> bool {
        self.value.matches(path)
    }

    pub fn is_done(&self) -> bool {
        self.status == Status::Done
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
