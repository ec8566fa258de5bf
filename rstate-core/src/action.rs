//! Actions and the effects they produce.
//!
//! Actions are declared on entry, exit and transitions. Built-in actions are
//! objects tagged by `type`; a bare string names a registered implementation:
//!
//! ```json
//! "entry": [
//!   "notify",
//!   {"type": "assign", "set": {"ready": true}},
//!   {"type": "raise", "event": "CHECK"},
//!   {"type": "spawn", "id": "worker", "src": "fetcher", "input": {"url": "/a"}}
//! ]
//! ```
//!
//! The resolver applies assigns and raises itself. Everything else is turned
//! into an [`Effect`] that the runtime executes once the microstep commits.

use crate::definition::StateId;
use crate::error::{ActionError, CoreError};
use crate::event::Event;
use crate::implementations::{ActionImpl, Implementations};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Side-effecting action implementation.
pub type ActionFn = Arc<dyn Fn(&ActionArgs<'_>) -> Result<(), ActionError> + Send + Sync>;

/// Context reducer: receives the current context and event, returns the next context.
pub type AssignFn = Arc<dyn Fn(&Value, &Event) -> Value + Send + Sync>;

/// Handle through which a custom action talks back to its actor.
pub trait EventSender: Send + Sync {
    /// Id of the actor executing the action.
    fn id(&self) -> &str;

    /// Queues an event on the actor itself. Processed after the current step.
    fn send(&self, event: Event);

    /// Sends an event to a registered child. Unknown children are ignored.
    fn send_to(&self, child: &str, event: Event);
}

/// Arguments handed to a custom action.
pub struct ActionArgs<'a> {
    /// Context as of this action's position in the action list.
    pub context: &'a Value,
    pub event: &'a Event,
    pub actor: &'a dyn EventSender,
}

/// Event as written inside an action: a bare type or a full event object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventConfig {
    Type(String),
    Full(Event),
}

impl From<EventConfig> for Event {
    fn from(config: EventConfig) -> Self {
        match config {
            EventConfig::Type(t) => Event::new(t),
            EventConfig::Full(e) => e,
        }
    }
}

/// Action as written in a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionConfig {
    Named(String),
    Builtin(BuiltinAction),
}

/// Built-in actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuiltinAction {
    Assign {
        #[serde(default)]
        set: Option<Map<String, Value>>,
        #[serde(default)]
        merge_event: bool,
        #[serde(default)]
        name: Option<String>,
    },
    Raise {
        event: EventConfig,
    },
    SendParent {
        event: EventConfig,
    },
    SendTo {
        to: String,
        event: EventConfig,
    },
    Spawn {
        id: String,
        src: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        assign_ref: Option<String>,
    },
    Stop {
        id: String,
    },
    Log {
        message: String,
    },
}

/// How an assign computes the next context.
#[derive(Clone)]
pub enum Assignment {
    /// Merge literal fields into the context object.
    Set(Map<String, Value>),
    /// Merge the event payload object into the context object.
    MergeEvent,
    /// Apply a named reducer.
    Reducer { name: String, reducer: AssignFn },
}

impl Assignment {
    /// Produces the next context. The input is never modified.
    pub fn apply(&self, ctx: &Value, event: &Event) -> Value {
        match self {
            Assignment::Set(fields) => merge_fields(ctx, fields),
            Assignment::MergeEvent => match &event.data {
                Value::Object(payload) => merge_fields(ctx, payload),
                _ => ctx.clone(),
            },
            Assignment::Reducer { reducer, .. } => reducer(ctx, event),
        }
    }
}

/// Merges fields into a context object. A null context is treated as empty.
fn merge_fields(ctx: &Value, fields: &Map<String, Value>) -> Value {
    match ctx {
        Value::Object(ctx_map) => {
            let mut result = ctx_map.clone();
            for (k, v) in fields {
                result.insert(k.clone(), v.clone());
            }
            Value::Object(result)
        }
        Value::Null => Value::Object(fields.clone()),
        _ => ctx.clone(),
    }
}

/// Declaration of a child actor to spawn.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnDef {
    pub id: String,
    pub src: String,
    pub input: Value,
    /// Context field that receives the child id.
    pub assign_ref: Option<String>,
}

/// A resolved action.
#[derive(Clone)]
pub enum Action {
    Assign(Assignment),
    Raise(Event),
    SendParent(Event),
    SendTo { to: String, event: Event },
    Spawn(SpawnDef),
    Stop { id: String },
    Log(String),
    Custom { name: String, exec: ActionFn },
}

impl Action {
    /// Resolves an action config against the registered implementations.
    pub fn resolve(config: &ActionConfig, impls: &Implementations) -> Result<Self, CoreError> {
        match config {
            ActionConfig::Named(name) => match impls.action(name) {
                Some(ActionImpl::Effect(exec)) => Ok(Action::Custom {
                    name: name.clone(),
                    exec,
                }),
                Some(ActionImpl::Assign(reducer)) => Ok(Action::Assign(Assignment::Reducer {
                    name: name.clone(),
                    reducer,
                })),
                None => Err(CoreError::UnresolvedImplementation {
                    kind: "action",
                    name: name.clone(),
                }),
            },
            ActionConfig::Builtin(builtin) => Self::resolve_builtin(builtin, impls),
        }
    }

    fn resolve_builtin(
        builtin: &BuiltinAction,
        impls: &Implementations,
    ) -> Result<Self, CoreError> {
        let action = match builtin {
            BuiltinAction::Assign {
                set,
                merge_event,
                name,
            } => {
                let configured = [set.is_some(), *merge_event, name.is_some()]
                    .iter()
                    .filter(|b| **b)
                    .count();
                if configured != 1 {
                    return Err(CoreError::InvalidDefinition {
                        reason: "assign needs exactly one of 'set', 'merge_event' or 'name'"
                            .to_string(),
                    });
                }
                if let Some(fields) = set {
                    Action::Assign(Assignment::Set(fields.clone()))
                } else if let Some(name) = name {
                    match impls.action(name) {
                        Some(ActionImpl::Assign(reducer)) => Action::Assign(Assignment::Reducer {
                            name: name.clone(),
                            reducer,
                        }),
                        _ => {
                            return Err(CoreError::UnresolvedImplementation {
                                kind: "assign",
                                name: name.clone(),
                            })
                        }
                    }
                } else {
                    Action::Assign(Assignment::MergeEvent)
                }
            }
            BuiltinAction::Raise { event } => Action::Raise(event.clone().into()),
            BuiltinAction::SendParent { event } => Action::SendParent(event.clone().into()),
            BuiltinAction::SendTo { to, event } => Action::SendTo {
                to: to.clone(),
                event: event.clone().into(),
            },
            BuiltinAction::Spawn {
                id,
                src,
                input,
                assign_ref,
            } => {
                if !impls.has_actor(src) {
                    return Err(CoreError::UnresolvedImplementation {
                        kind: "actor",
                        name: src.clone(),
                    });
                }
                Action::Spawn(SpawnDef {
                    id: id.clone(),
                    src: src.clone(),
                    input: input.clone(),
                    assign_ref: assign_ref.clone(),
                })
            }
            BuiltinAction::Stop { id } => Action::Stop { id: id.clone() },
            BuiltinAction::Log { message } => Action::Log(message.clone()),
        };
        Ok(action)
    }

    pub fn name(&self) -> &str {
        match self {
            Action::Assign(Assignment::Reducer { name, .. }) => name,
            Action::Assign(_) => "assign",
            Action::Raise(_) => "raise",
            Action::SendParent(_) => "send_parent",
            Action::SendTo { .. } => "send_to",
            Action::Spawn(_) => "spawn",
            Action::Stop { .. } => "stop",
            Action::Log(_) => "log",
            Action::Custom { name, .. } => name,
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Action({})", self.name())
    }
}

/// A command produced by the resolver for the runtime to carry out.
#[derive(Clone)]
pub enum Effect {
    /// Run a custom action with the context as of its position in the list.
    Custom {
        name: String,
        exec: ActionFn,
        context: Arc<Value>,
        event: Event,
    },
    /// Start a child actor owned by `owner`.
    Spawn {
        id: String,
        src: String,
        input: Value,
        owner: StateId,
    },
    /// Stop a child actor.
    Stop { id: String },
    SendParent(Event),
    SendTo { to: String, event: Event },
    Log { message: String },
}

impl Effect {
    pub fn name(&self) -> &str {
        match self {
            Effect::Custom { name, .. } => name,
            Effect::Spawn { .. } => "spawn",
            Effect::Stop { .. } => "stop",
            Effect::SendParent(_) => "send_parent",
            Effect::SendTo { .. } => "send_to",
            Effect::Log { .. } => "log",
        }
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Custom { name, event, .. } => f
                .debug_struct("Custom")
                .field("name", name)
                .field("event", &event.event_type)
                .finish(),
            Effect::Spawn { id, src, owner, .. } => f
                .debug_struct("Spawn")
                .field("id", id)
                .field("src", src)
                .field("owner", owner)
                .finish(),
            Effect::Stop { id } => f.debug_struct("Stop").field("id", id).finish(),
            Effect::SendParent(event) => f
                .debug_tuple("SendParent")
                .field(&event.event_type)
                .finish(),
            Effect::SendTo { to, event } => f
                .debug_struct("SendTo")
                .field("to", to)
                .field("event", &event.event_type)
                .finish(),
            Effect::Log { message } => f.debug_struct("Log").field("message", message).finish(),
        }
    }
}
