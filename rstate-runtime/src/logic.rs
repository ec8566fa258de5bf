//! Spawnable actor logic and machine options.

use crate::config::{Config, DEFAULT_BROADCAST_CAPACITY};
use crate::error::{ActorError, RuntimeError};
use futures::future::BoxFuture;
use futures::FutureExt;
use rstate_core::{
    ActionArgs, ActionError, CoreError, EngineConfig, Event, GuardError, Implementations,
    MachineDefinition,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// How an asynchronous task finishes. A task emits exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Completed; the parent receives `done.invoke.<id>` with this output.
    Done(Value),
    /// Sends this event to the parent and finishes.
    Emit(Event),
}

/// Asynchronous task body. Receives the spawn input.
pub type TaskFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<TaskOutcome, ActorError>> + Send + Sync>;

/// Logic a child actor runs.
#[derive(Clone)]
pub enum ActorLogic {
    /// A nested machine.
    Machine(Arc<MachineLogic>),
    /// An asynchronous task on the ambient tokio runtime.
    Task(TaskFn),
}

impl ActorLogic {
    pub fn machine(logic: MachineLogic) -> Self {
        ActorLogic::Machine(Arc::new(logic))
    }

    /// Wraps an async function as task logic.
    pub fn task<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutcome, ActorError>> + Send + 'static,
    {
        ActorLogic::Task(Arc::new(move |input| f(input).boxed()))
    }
}

impl fmt::Debug for ActorLogic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorLogic::Machine(logic) => f
                .debug_tuple("Machine")
                .field(&logic.definition.id)
                .finish(),
            ActorLogic::Task(_) => f.write_str("Task"),
        }
    }
}

/// Options for creating a machine.
#[derive(Clone)]
pub struct MachineOptions {
    /// Overrides the definition's initial context.
    pub context: Option<Value>,
    pub implementations: Implementations,
    pub actors: HashMap<String, ActorLogic>,
    pub engine: EngineConfig,
    pub broadcast_capacity: usize,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            context: None,
            implementations: Implementations::new(),
            actors: HashMap::new(),
            engine: EngineConfig::default(),
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

impl MachineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_action<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&ActionArgs<'_>) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        self.implementations = self.implementations.with_action(name, f);
        self
    }

    pub fn with_assign<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &Event) -> Value + Send + Sync + 'static,
    {
        self.implementations = self.implementations.with_assign(name, f);
        self
    }

    pub fn with_guard<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &Event) -> Result<bool, GuardError> + Send + Sync + 'static,
    {
        self.implementations = self.implementations.with_guard(name, f);
        self
    }

    /// Registers spawnable logic under `name`.
    pub fn with_actor(mut self, name: impl Into<String>, logic: ActorLogic) -> Self {
        let name = name.into();
        self.implementations = self.implementations.with_actor(name.clone());
        self.actors.insert(name, logic);
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_engine_config(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Applies the engine and actor sections of a loaded config.
    pub fn with_config(mut self, config: &Config) -> Self {
        self.engine = config.engine.clone();
        self.broadcast_capacity = config.actors.broadcast_capacity;
        self
    }
}

impl fmt::Debug for MachineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut actors: Vec<_> = self.actors.keys().collect();
        actors.sort();
        f.debug_struct("MachineOptions")
            .field("context", &self.context)
            .field("implementations", &self.implementations)
            .field("actors", &actors)
            .field("engine", &self.engine)
            .finish()
    }
}

/// A resolved definition plus everything needed to run it.
pub struct MachineLogic {
    pub(crate) definition: Arc<MachineDefinition>,
    pub(crate) context: Option<Value>,
    pub(crate) actors: HashMap<String, ActorLogic>,
    pub(crate) engine: EngineConfig,
    pub(crate) broadcast_capacity: usize,
}

impl MachineLogic {
    /// Builds logic from a JSON definition. Every named action, guard and
    /// actor must be registered in `options`.
    pub fn new(definition: &Value, options: MachineOptions) -> Result<Self, RuntimeError> {
        let def = MachineDefinition::from_json(definition, &options.implementations)?;
        Self::from_definition(def, options)
    }

    /// Wraps an already built definition. Actions and guards are not resolved
    /// again, but every actor source the definition spawns must have logic in
    /// `options.actors`.
    pub fn from_definition(
        definition: MachineDefinition,
        options: MachineOptions,
    ) -> Result<Self, RuntimeError> {
        if let Some(src) = definition
            .actor_sources()
            .into_iter()
            .find(|src| !options.actors.contains_key(*src))
        {
            return Err(CoreError::UnresolvedImplementation {
                kind: "actor",
                name: src.to_string(),
            }
            .into());
        }

        Ok(Self {
            definition: Arc::new(definition),
            context: options.context,
            actors: options.actors,
            engine: options.engine,
            broadcast_capacity: options.broadcast_capacity,
        })
    }

    pub fn definition(&self) -> &Arc<MachineDefinition> {
        &self.definition
    }

    /// Initial context for an instance. Object input is merged over the
    /// configured context; any other non-null input is stored under `input`.
    pub(crate) fn initial_context(&self, input: Option<Value>) -> Value {
        let mut context = self
            .context
            .clone()
            .unwrap_or_else(|| self.definition.initial_context());
        match input {
            None | Some(Value::Null) => {}
            Some(Value::Object(fields)) => match &mut context {
                Value::Object(map) => map.extend(fields),
                _ => context = Value::Object(fields),
            },
            Some(other) => {
                if let Value::Object(map) = &mut context {
                    map.insert("input".to_string(), other);
                }
            }
        }
        context
    }
}

impl fmt::Debug for MachineLogic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineLogic")
            .field("definition", &self.definition.id)
            .field("checksum", &self.definition.checksum)
            .finish()
    }
}
