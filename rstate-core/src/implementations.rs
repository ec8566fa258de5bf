//! Named implementations referenced by a definition.
//!
//! Definitions refer to custom behavior by string name. Every name is
//! resolved against this registry while the definition is built; a missing
//! name is a definition error, never a runtime one.

use crate::action::{ActionArgs, ActionFn, AssignFn};
use crate::error::{ActionError, GuardError};
use crate::event::Event;
use crate::guard::GuardFn;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// A named action implementation.
#[derive(Clone)]
pub enum ActionImpl {
    /// Side effect, executed by the runtime after the microstep commits.
    Effect(ActionFn),
    /// Context reducer, applied by the resolver.
    Assign(AssignFn),
}

/// Registry of named actions, guards and actor sources.
#[derive(Clone, Default)]
pub struct Implementations {
    actions: HashMap<String, ActionImpl>,
    guards: HashMap<String, GuardFn>,
    actors: HashSet<String>,
}

impl Implementations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a side-effecting action.
    pub fn with_action<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&ActionArgs<'_>) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        self.actions
            .insert(name.into(), ActionImpl::Effect(Arc::new(f)));
        self
    }

    /// Registers a context reducer.
    pub fn with_assign<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &Event) -> Value + Send + Sync + 'static,
    {
        self.actions
            .insert(name.into(), ActionImpl::Assign(Arc::new(f)));
        self
    }

    /// Registers a guard predicate.
    pub fn with_guard<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &Event) -> Result<bool, GuardError> + Send + Sync + 'static,
    {
        self.guards.insert(name.into(), Arc::new(f));
        self
    }

    /// Declares an actor source name. The logic itself lives with the runtime.
    pub fn with_actor(mut self, name: impl Into<String>) -> Self {
        self.actors.insert(name.into());
        self
    }

    pub fn action(&self, name: &str) -> Option<ActionImpl> {
        self.actions.get(name).cloned()
    }

    pub fn guard(&self, name: &str) -> Option<GuardFn> {
        self.guards.get(name).cloned()
    }

    pub fn has_actor(&self, name: &str) -> bool {
        self.actors.contains(name)
    }
}

impl fmt::Debug for Implementations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut actions: Vec<_> = self.actions.keys().collect();
        actions.sort();
        let mut guards: Vec<_> = self.guards.keys().collect();
        guards.sort();
        let mut actors: Vec<_> = self.actors.iter().collect();
        actors.sort();
        f.debug_struct("Implementations")
            .field("actions", &actions)
            .field("guards", &guards)
            .field("actors", &actors)
            .finish()
    }
}
