//! State machine definition types.
//!
//! Machine definitions use a JSON DSL:
//!
//! ```json
//! {
//!   "id": "order",
//!   "initial": "created",
//!   "context": {"items_in_stock": true},
//!   "states": {
//!     "created": {"on": {"PAY": "paid"}},
//!     "paid": {
//!       "on": {
//!         "SHIP": {"target": "shipped", "guard": {"expr": "ctx.items_in_stock"}},
//!         "REFUND": "refunded"
//!       }
//!     },
//!     "shipped": {"on": {"DELIVER": "delivered"}},
//!     "delivered": {"type": "final"},
//!     "refunded": {"type": "final"}
//!   }
//! }
//! ```
//!
//! A definition is validated once and indexed into an arena of nodes. Nodes
//! are numbered in document (pre-order) order, so a node's descendants are
//! exactly the ids following it up to the end of its subtree.

use crate::action::{Action, ActionConfig, SpawnDef};
use crate::error::CoreError;
use crate::event::EventDescriptor;
use crate::guard::{Guard, GuardConfig};
use crate::implementations::Implementations;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;

/// Id given to the root node when the definition does not name one.
pub const DEFAULT_MACHINE_ID: &str = "machine";

/// Index of a node in a definition's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(pub usize);

impl StateId {
    pub const ROOT: StateId = StateId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of a state node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    Atomic,
    Compound,
    Parallel,
    History,
    Final,
}

/// What a history node remembers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    /// The active direct children of the parent.
    #[default]
    Shallow,
    /// The active atomic descendants of the parent.
    Deep,
}

/// A single value or a list of values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    pub fn is_empty(&self) -> bool {
        matches!(self, OneOrMany::Many(v) if v.is_empty())
    }

    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::Many(v) => v,
            OneOrMany::One(t) => std::slice::from_ref(t),
        }
    }
}

/// One entry of an `on` or `always` list: a bare target or a full transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransitionItem {
    Target(String),
    Config(TransitionConfig),
}

/// A transition as written in a definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransitionConfig {
    /// Target(s). Absent means a targetless transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<OneOrMany<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<GuardConfig>,

    #[serde(default, skip_serializing_if = "OneOrMany::is_empty")]
    pub actions: OneOrMany<ActionConfig>,

    /// Exit and re-enter the source even when all targets are its descendants.
    #[serde(default)]
    pub reenter: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A child actor invoked while a state is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub src: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,
}

/// A state node as written in a definition. The root node is the machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateNodeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<StateKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,

    /// Initial context. Only read on the root node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,

    #[serde(default, with = "ordered_map", skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<(String, StateNodeConfig)>,

    #[serde(default, with = "ordered_map", skip_serializing_if = "Vec::is_empty")]
    pub on: Vec<(String, OneOrMany<TransitionItem>)>,

    #[serde(default, skip_serializing_if = "OneOrMany::is_empty")]
    pub always: OneOrMany<TransitionItem>,

    #[serde(default, skip_serializing_if = "OneOrMany::is_empty")]
    pub entry: OneOrMany<ActionConfig>,

    #[serde(default, skip_serializing_if = "OneOrMany::is_empty")]
    pub exit: OneOrMany<ActionConfig>,

    #[serde(default, skip_serializing_if = "OneOrMany::is_empty")]
    pub invoke: OneOrMany<InvokeConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryKind>,

    /// Default target of a history node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// JSON objects as ordered key/value lists, so document order survives parsing.
mod ordered_map {
    use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
    use serde::ser::{Serialize, SerializeMap, Serializer};
    use std::fmt;
    use std::marker::PhantomData;

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Vec<(String, T)>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        struct OrderedVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedVisitor<T> {
            type Value = Vec<(String, T)>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, T>()? {
                    entries.push((key, value));
                }
                Ok(entries)
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S, T>(entries: &Vec<(String, T)>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (key, value) in entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// A resolved transition.
#[derive(Debug, Clone)]
pub struct TransitionDef {
    pub source: StateId,
    /// `None` for eventless (`always`) transitions.
    pub event: Option<EventDescriptor>,
    /// Empty for targetless transitions.
    pub targets: Vec<StateId>,
    pub guard: Option<Guard>,
    pub actions: Vec<Action>,
    pub reenter: bool,
    /// Position in document order across the whole definition.
    pub order: usize,
}

impl TransitionDef {
    pub fn is_targetless(&self) -> bool {
        self.targets.is_empty()
    }
}

/// A validated state node.
#[derive(Debug, Clone)]
pub struct StateNode {
    pub index: StateId,
    /// Key under the parent's `states`.
    pub key: String,
    /// Unique id: the custom `id`, else the dotted path from the machine id.
    pub id: String,
    pub path: String,
    pub kind: StateKind,
    pub parent: Option<StateId>,
    pub children: Vec<StateId>,
    /// Initial child of a compound node.
    pub initial: Option<StateId>,
    pub transitions: Vec<TransitionDef>,
    pub always: Vec<TransitionDef>,
    pub entry: Vec<Action>,
    pub exit: Vec<Action>,
    pub invoke: Vec<SpawnDef>,
    pub history: HistoryKind,
    /// Default targets of a history node.
    pub history_target: Vec<StateId>,
    pub output: Option<Value>,
    pub description: Option<String>,
    pub depth: usize,
    /// Last index in this node's subtree.
    subtree_end: usize,
}

impl StateNode {
    /// Atomic and final nodes have no child states.
    pub fn is_atomic(&self) -> bool {
        matches!(self.kind, StateKind::Atomic | StateKind::Final)
    }

    pub fn is_final(&self) -> bool {
        self.kind == StateKind::Final
    }

    pub fn is_history(&self) -> bool {
        self.kind == StateKind::History
    }

    /// Transitions whose descriptor matches `event_type`, most specific first.
    /// Transitions with equally specific descriptors keep document order.
    pub fn candidates(&self, event_type: &str) -> Vec<&TransitionDef> {
        let mut matching: Vec<&TransitionDef> = self
            .transitions
            .iter()
            .filter(|t| t.event.as_ref().is_some_and(|d| d.matches(event_type)))
            .collect();
        matching.sort_by_key(|t| {
            (
                Reverse(t.event.as_ref().map(|d| d.specificity()).unwrap_or(0)),
                t.order,
            )
        });
        matching
    }
}

/// Validated and indexed machine definition.
#[derive(Debug, Clone)]
pub struct MachineDefinition {
    /// Machine id (the root node's id).
    pub id: String,

    nodes: Vec<StateNode>,

    /// Node id -> index.
    ids: HashMap<String, StateId>,

    context: Value,

    /// Original definition as JSON.
    raw: Value,

    /// Hash of the definition for integrity checks.
    pub checksum: String,
}

impl MachineDefinition {
    /// Parses and validates a machine definition from JSON.
    pub fn from_json(json: &Value, impls: &Implementations) -> Result<Self, CoreError> {
        let config: StateNodeConfig = serde_json::from_value(json.clone())?;
        Self::build(config, json.clone(), impls)
    }

    /// Validates a machine definition from an already parsed config.
    pub fn from_config(
        config: StateNodeConfig,
        impls: &Implementations,
    ) -> Result<Self, CoreError> {
        let raw = serde_json::to_value(&config)?;
        Self::build(config, raw, impls)
    }

    fn build(
        config: StateNodeConfig,
        raw: Value,
        impls: &Implementations,
    ) -> Result<Self, CoreError> {
        if matches!(config.kind, Some(StateKind::History) | Some(StateKind::Final)) {
            return Err(CoreError::InvalidDefinition {
                reason: "machine root must be a compound, parallel or atomic state".to_string(),
            });
        }

        let machine_id = config
            .id
            .clone()
            .unwrap_or_else(|| DEFAULT_MACHINE_ID.to_string());

        // Pass 1: lay out the arena
        let mut nodes = Vec::new();
        let mut configs = Vec::new();
        allocate(&config, String::new(), None, machine_id.clone(), 0, &mut nodes, &mut configs)?;

        let mut ids = HashMap::with_capacity(nodes.len());
        for node in &nodes {
            if ids.insert(node.id.clone(), node.index).is_some() {
                return Err(CoreError::DuplicateStateId {
                    id: node.id.clone(),
                });
            }
        }

        // Pass 2: resolve references now that every node is addressable
        let mut order = 0;
        let mut resolved = Vec::with_capacity(nodes.len());
        for (index, node_config) in configs.iter().enumerate() {
            let source = StateId(index);
            let mut parts = ResolvedParts::default();

            if nodes[index].kind == StateKind::Compound {
                parts.initial = Some(resolve_initial(&nodes, source, node_config)?);
            }

            for (descriptor, items) in &node_config.on {
                let descriptor = EventDescriptor::parse(descriptor)?;
                for item in items.as_slice() {
                    parts.transitions.push(build_transition(
                        &nodes,
                        &ids,
                        source,
                        Some(descriptor.clone()),
                        item,
                        impls,
                        order,
                    )?);
                    order += 1;
                }
            }
            for item in node_config.always.as_slice() {
                parts
                    .always
                    .push(build_transition(&nodes, &ids, source, None, item, impls, order)?);
                order += 1;
            }

            parts.entry = resolve_actions(node_config.entry.as_slice(), impls)?;
            parts.exit = resolve_actions(node_config.exit.as_slice(), impls)?;

            for (i, invoke) in node_config.invoke.as_slice().iter().enumerate() {
                if !impls.has_actor(&invoke.src) {
                    return Err(CoreError::UnresolvedImplementation {
                        kind: "actor",
                        name: invoke.src.clone(),
                    });
                }
                parts.invoke.push(SpawnDef {
                    id: invoke
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("{}:invocation[{}]", nodes[index].id, i)),
                    src: invoke.src.clone(),
                    input: invoke.input.clone(),
                    assign_ref: None,
                });
            }

            if nodes[index].kind == StateKind::History {
                parts.history = node_config.history.unwrap_or_default();
                if let Some(target) = &node_config.target {
                    let target_id = resolve_target(&nodes, &ids, source, target)?;
                    let parent = nodes[index].parent.unwrap_or(StateId::ROOT);
                    if !is_descendant_in(&nodes, target_id, parent) {
                        return Err(CoreError::InvalidDefinition {
                            reason: format!(
                                "history default target '{}' is outside '{}'",
                                target, nodes[parent.0].id
                            ),
                        });
                    }
                    parts.history_target = vec![target_id];
                }
            }

            resolved.push(parts);
        }

        for (node, parts) in nodes.iter_mut().zip(resolved) {
            node.initial = parts.initial;
            node.transitions = parts.transitions;
            node.always = parts.always;
            node.entry = parts.entry;
            node.exit = parts.exit;
            node.invoke = parts.invoke;
            node.history = parts.history;
            node.history_target = parts.history_target;
        }

        let definition = Self {
            id: machine_id,
            nodes,
            ids,
            context: config
                .context
                .clone()
                .unwrap_or_else(|| Value::Object(Default::default())),
            checksum: format!("{:08x}", crc32c::crc32c(&serde_json::to_vec(&raw)?)),
            raw,
        };
        definition.validate_targets()?;
        Ok(definition)
    }

    /// Rejects multi-target transitions whose targets are not in orthogonal regions.
    fn validate_targets(&self) -> Result<(), CoreError> {
        for node in &self.nodes {
            for t in node.transitions.iter().chain(node.always.iter()) {
                for (i, a) in t.targets.iter().enumerate() {
                    for b in &t.targets[i + 1..] {
                        let orthogonal = a != b
                            && !self.is_descendant(*a, *b)
                            && !self.is_descendant(*b, *a)
                            && self
                                .proper_ancestors(*a, None)
                                .into_iter()
                                .find(|anc| self.is_descendant(*b, *anc))
                                .is_some_and(|lca| self.node(lca).kind == StateKind::Parallel);
                        if !orthogonal {
                            return Err(CoreError::InvalidDefinition {
                                reason: format!(
                                    "targets '{}' and '{}' from '{}' are not orthogonal",
                                    self.node(*a).id,
                                    self.node(*b).id,
                                    node.id
                                ),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn root(&self) -> &StateNode {
        &self.nodes[0]
    }

    /// Returns a node by index. Indices always come from this definition.
    pub fn node(&self, id: StateId) -> &StateNode {
        &self.nodes[id.0]
    }

    pub fn get(&self, id: StateId) -> Option<&StateNode> {
        self.nodes.get(id.0)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &StateNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Looks a node up by id (with or without `#`), full path, or key path
    /// relative to the root (`"a.b"`).
    pub fn find(&self, path_or_id: &str) -> Option<StateId> {
        let key = path_or_id.strip_prefix('#').unwrap_or(path_or_id);
        if let Some(id) = self.ids.get(key) {
            return Some(*id);
        }
        if let Some(node) = self.nodes.iter().find(|n| n.path == key) {
            return Some(node.index);
        }
        descend(&self.nodes, StateId::ROOT, key)
    }

    /// Returns true if `a` is a proper descendant of `b`.
    pub fn is_descendant(&self, a: StateId, b: StateId) -> bool {
        is_descendant_in(&self.nodes, a, b)
    }

    /// Ancestors of `id` from its parent upwards, stopping before `upto`.
    pub fn proper_ancestors(&self, id: StateId, upto: Option<StateId>) -> Vec<StateId> {
        let mut ancestors = Vec::new();
        let mut current = self.nodes[id.0].parent;
        while let Some(p) = current {
            if Some(p) == upto {
                break;
            }
            ancestors.push(p);
            current = self.nodes[p.0].parent;
        }
        ancestors
    }

    pub fn parent(&self, id: StateId) -> Option<StateId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: StateId) -> &[StateId] {
        &self.nodes[id.0].children
    }

    /// Every event descriptor declared anywhere, in document order, deduplicated.
    pub fn events(&self) -> Vec<String> {
        let mut events: Vec<String> = Vec::new();
        for node in &self.nodes {
            for t in &node.transitions {
                if let Some(descriptor) = &t.event {
                    let descriptor = descriptor.as_string();
                    if !events.contains(&descriptor) {
                        events.push(descriptor);
                    }
                }
            }
        }
        events
    }

    /// Every actor source the definition spawns, from `invoke` declarations
    /// and `spawn` actions, in document order, deduplicated.
    pub fn actor_sources(&self) -> Vec<&str> {
        let mut sources: Vec<&str> = Vec::new();
        for node in &self.nodes {
            let transition_actions = node
                .transitions
                .iter()
                .chain(&node.always)
                .flat_map(|t| &t.actions);
            let spawned = node
                .entry
                .iter()
                .chain(&node.exit)
                .chain(transition_actions)
                .filter_map(|action| match action {
                    Action::Spawn(spawn) => Some(spawn.src.as_str()),
                    _ => None,
                });
            for src in node.invoke.iter().map(|i| i.src.as_str()).chain(spawned) {
                if !sources.contains(&src) {
                    sources.push(src);
                }
            }
        }
        sources
    }

    pub fn initial_context(&self) -> Value {
        self.context.clone()
    }

    /// Returns the definition as JSON.
    pub fn to_json(&self) -> &Value {
        &self.raw
    }
}

#[derive(Default)]
struct ResolvedParts {
    initial: Option<StateId>,
    transitions: Vec<TransitionDef>,
    always: Vec<TransitionDef>,
    entry: Vec<Action>,
    exit: Vec<Action>,
    invoke: Vec<SpawnDef>,
    history: HistoryKind,
    history_target: Vec<StateId>,
}

fn allocate<'c>(
    config: &'c StateNodeConfig,
    key: String,
    parent: Option<StateId>,
    path: String,
    depth: usize,
    nodes: &mut Vec<StateNode>,
    configs: &mut Vec<&'c StateNodeConfig>,
) -> Result<StateId, CoreError> {
    let index = StateId(nodes.len());
    let kind = config.kind.unwrap_or(if config.states.is_empty() {
        StateKind::Atomic
    } else {
        StateKind::Compound
    });

    match kind {
        StateKind::Compound | StateKind::Parallel if config.states.is_empty() => {
            return Err(CoreError::InvalidDefinition {
                reason: format!("state '{}' of type {:?} has no child states", path, kind),
            });
        }
        StateKind::Atomic | StateKind::History | StateKind::Final if !config.states.is_empty() => {
            return Err(CoreError::InvalidDefinition {
                reason: format!("state '{}' of type {:?} cannot have child states", path, kind),
            });
        }
        StateKind::History if parent.is_none() => {
            return Err(CoreError::InvalidDefinition {
                reason: "history state must have a parent".to_string(),
            });
        }
        _ => {}
    }
    if config.initial.is_some() && kind != StateKind::Compound {
        return Err(CoreError::InvalidDefinition {
            reason: format!("state '{}' is not compound but declares 'initial'", path),
        });
    }
    if kind == StateKind::Final {
        if let Some(p) = parent {
            if nodes[p.0].kind != StateKind::Compound {
                return Err(CoreError::InvalidDefinition {
                    reason: format!("final state '{}' must be a child of a compound state", path),
                });
            }
        }
    }

    let id = match (&config.id, parent) {
        (Some(custom), Some(_)) => custom.clone(),
        _ => path.clone(),
    };
    nodes.push(StateNode {
        index,
        key,
        id,
        path: path.clone(),
        kind,
        parent,
        children: Vec::new(),
        initial: None,
        transitions: Vec::new(),
        always: Vec::new(),
        entry: Vec::new(),
        exit: Vec::new(),
        invoke: Vec::new(),
        history: HistoryKind::default(),
        history_target: Vec::new(),
        output: config.output.clone(),
        description: config.description.clone(),
        depth,
        subtree_end: index.0,
    });
    configs.push(config);

    for (child_key, child_config) in &config.states {
        if child_key.is_empty() || child_key.contains('.') || child_key.starts_with('#') {
            return Err(CoreError::InvalidDefinition {
                reason: format!("invalid state key '{}' in '{}'", child_key, path),
            });
        }
        let child = allocate(
            child_config,
            child_key.clone(),
            Some(index),
            format!("{}.{}", path, child_key),
            depth + 1,
            nodes,
            configs,
        )?;
        nodes[index.0].children.push(child);
    }
    nodes[index.0].subtree_end = nodes.len() - 1;

    Ok(index)
}

fn resolve_initial(
    nodes: &[StateNode],
    source: StateId,
    config: &StateNodeConfig,
) -> Result<StateId, CoreError> {
    let node = &nodes[source.0];
    match &config.initial {
        Some(key) => node
            .children
            .iter()
            .copied()
            .find(|c| nodes[c.0].key == *key)
            .ok_or_else(|| CoreError::InvalidDefinition {
                reason: format!("initial state '{}' is not a child of '{}'", key, node.id),
            }),
        None => node
            .children
            .iter()
            .copied()
            .find(|c| !nodes[c.0].is_history())
            .ok_or_else(|| CoreError::InvalidDefinition {
                reason: format!("compound state '{}' has no initial state", node.id),
            }),
    }
}

fn build_transition(
    nodes: &[StateNode],
    ids: &HashMap<String, StateId>,
    source: StateId,
    event: Option<EventDescriptor>,
    item: &TransitionItem,
    impls: &Implementations,
    order: usize,
) -> Result<TransitionDef, CoreError> {
    let mut transition = TransitionDef {
        source,
        event,
        targets: Vec::new(),
        guard: None,
        actions: Vec::new(),
        reenter: false,
        order,
    };

    match item {
        TransitionItem::Target(target) => {
            transition.targets = vec![resolve_target(nodes, ids, source, target)?];
        }
        TransitionItem::Config(config) => {
            if let Some(targets) = &config.target {
                transition.targets = targets
                    .as_slice()
                    .iter()
                    .map(|t| resolve_target(nodes, ids, source, t))
                    .collect::<Result<_, _>>()?;
            }
            if let Some(guard) = &config.guard {
                transition.guard = Some(Guard::resolve(guard, impls)?);
            }
            transition.actions = resolve_actions(config.actions.as_slice(), impls)?;
            transition.reenter = config.reenter;
        }
    }

    Ok(transition)
}

fn resolve_actions(
    configs: &[ActionConfig],
    impls: &Implementations,
) -> Result<Vec<Action>, CoreError> {
    configs.iter().map(|c| Action::resolve(c, impls)).collect()
}

/// Resolves a target reference: `"#id"` is absolute, `".child"` is relative
/// to the source, anything else names a sibling (or a root child when the
/// source is the root).
fn resolve_target(
    nodes: &[StateNode],
    ids: &HashMap<String, StateId>,
    source: StateId,
    target: &str,
) -> Result<StateId, CoreError> {
    let unknown = || CoreError::UnknownTarget {
        source_id: nodes[source.0].id.clone(),
        target: target.to_string(),
    };

    if let Some(absolute) = target.strip_prefix('#') {
        if let Some(id) = ids.get(absolute) {
            return Ok(*id);
        }
        // "#id.child.grandchild"
        for (split, _) in absolute.rmatch_indices('.') {
            if let Some(base) = ids.get(&absolute[..split]) {
                return descend(nodes, *base, &absolute[split + 1..]).ok_or_else(unknown);
            }
        }
        return Err(unknown());
    }

    if let Some(relative) = target.strip_prefix('.') {
        return descend(nodes, source, relative).ok_or_else(unknown);
    }

    let base = nodes[source.0].parent.unwrap_or(source);
    descend(nodes, base, target).ok_or_else(unknown)
}

fn descend(nodes: &[StateNode], from: StateId, relative: &str) -> Option<StateId> {
    if relative.is_empty() {
        return None;
    }
    let mut current = from;
    for key in relative.split('.') {
        current = nodes[current.0]
            .children
            .iter()
            .copied()
            .find(|c| nodes[c.0].key == key)?;
    }
    Some(current)
}

fn is_descendant_in(nodes: &[StateNode], a: StateId, b: StateId) -> bool {
    a.0 > b.0 && a.0 <= nodes[b.0].subtree_end
}
