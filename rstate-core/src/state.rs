//! Machine state: configuration, context, history and status.

use crate::definition::{MachineDefinition, StateId, StateKind};
use crate::event::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Lifecycle status of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Machine is accepting events.
    #[default]
    Active,
    /// A top-level final state was reached.
    Done,
    /// The machine hit a fatal error.
    Error,
}

/// Active state value: a leaf key, or a map for compound and parallel nodes.
///
/// ```json
/// "idle"
/// {"payment": "pending"}
/// {"upload": "done", "download": "running"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Leaf(String),
    Nested(BTreeMap<String, StateValue>),
}

impl StateValue {
    /// Returns true if the dotted key path is active in this value.
    /// `"a"` matches both `"a"` and `{"a": ...}`; `"a.b"` walks into `a`.
    pub fn matches(&self, path: &str) -> bool {
        let mut current = self;
        let mut parts = path.split('.').peekable();
        while let Some(part) = parts.next() {
            match current {
                StateValue::Leaf(key) => return key == part && parts.peek().is_none(),
                StateValue::Nested(map) => match map.get(part) {
                    Some(inner) => current = inner,
                    None => return false,
                },
            }
        }
        true
    }
}

/// History recorded per history node.
pub type HistoryMap = BTreeMap<StateId, Vec<StateId>>;

/// State of one machine instance.
///
/// Context and history are shared behind `Arc`s; a microstep that does not
/// touch them hands the same pointers on.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineState {
    /// Every active node, ancestors included, in document order.
    pub configuration: BTreeSet<StateId>,
    pub context: Arc<Value>,
    pub history: Arc<HistoryMap>,
    pub status: Status,
    /// Output of the machine once done.
    pub output: Option<Value>,
    /// Error message once failed.
    pub error: Option<String>,
    /// Last event that caused a microstep.
    pub event: Event,
}

impl MachineState {
    /// Empty state from which the initial configuration is entered.
    pub fn pre_initial(context: Value) -> Self {
        Self {
            configuration: BTreeSet::new(),
            context: Arc::new(context),
            history: Arc::new(HistoryMap::new()),
            status: Status::Active,
            output: None,
            error: None,
            event: Event::init(),
        }
    }

    pub fn is_active(&self, id: StateId) -> bool {
        self.configuration.contains(&id)
    }

    /// Active atomic and final nodes, in document order.
    pub fn atomic_states(&self, def: &MachineDefinition) -> Vec<StateId> {
        self.configuration
            .iter()
            .copied()
            .filter(|id| def.node(*id).is_atomic())
            .collect()
    }

    /// Computes the state value of the configuration.
    pub fn value(&self, def: &MachineDefinition) -> StateValue {
        self.value_of(def, StateId::ROOT)
    }

    fn value_of(&self, def: &MachineDefinition, id: StateId) -> StateValue {
        let node = def.node(id);
        match node.kind {
            StateKind::Compound => {
                let active = node
                    .children
                    .iter()
                    .copied()
                    .find(|c| self.configuration.contains(c));
                match active {
                    Some(child) if def.node(child).is_atomic() => {
                        StateValue::Leaf(def.node(child).key.clone())
                    }
                    Some(child) => {
                        let mut map = BTreeMap::new();
                        map.insert(def.node(child).key.clone(), self.value_of(def, child));
                        StateValue::Nested(map)
                    }
                    None => StateValue::Nested(BTreeMap::new()),
                }
            }
            StateKind::Parallel => {
                let regions = node
                    .children
                    .iter()
                    .copied()
                    .filter(|c| self.configuration.contains(c))
                    .map(|c| (def.node(c).key.clone(), self.value_of(def, c)))
                    .collect();
                StateValue::Nested(regions)
            }
            _ => StateValue::Nested(BTreeMap::new()),
        }
    }

    /// Returns true if the state path (`"a.b"` from the root, or a node id
    /// prefixed with `#`) is active.
    pub fn matches(&self, def: &MachineDefinition, path: &str) -> bool {
        if path.starts_with('#') {
            return def.find(path).is_some_and(|id| self.is_active(id));
        }
        self.value(def).matches(path)
    }

    /// Checks that the configuration is closed under ancestry, that each
    /// active compound has exactly one active child, and that each active
    /// parallel node has all its regions active.
    pub fn is_consistent(&self, def: &MachineDefinition) -> bool {
        if self.configuration.is_empty() {
            return false;
        }
        for id in &self.configuration {
            let node = def.node(*id);
            if node.is_history() {
                return false;
            }
            if let Some(parent) = node.parent {
                if !self.configuration.contains(&parent) {
                    return false;
                }
            }
            match node.kind {
                StateKind::Compound => {
                    let active = node
                        .children
                        .iter()
                        .filter(|c| self.configuration.contains(c))
                        .count();
                    if active != 1 {
                        return false;
                    }
                }
                StateKind::Parallel => {
                    let all_active = node
                        .children
                        .iter()
                        .filter(|c| !def.node(**c).is_history())
                        .all(|c| self.configuration.contains(c));
                    if !all_active {
                        return false;
                    }
                }
                _ => {}
            }
        }
        true
    }
}
