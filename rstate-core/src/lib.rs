//! # rstate-core
//!
//! Statechart engine for rstate.
//!
//! This crate provides:
//! - Machine definition parsing and validation
//! - Guard expression evaluation
//! - Transition resolution (microsteps) over hierarchical and parallel states
//! - Macrostep execution to quiescence
//!
//! Everything here is synchronous and free of I/O. Side effects come out of
//! the resolver as [`Effect`] values for a runtime to execute.

pub mod action;
pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod guard;
pub mod implementations;
pub mod macrostep;
pub mod resolver;
pub mod state;

pub use action::{Action, ActionArgs, ActionConfig, Effect, EventSender, SpawnDef};
pub use config::EngineConfig;
pub use definition::{
    MachineDefinition, StateId, StateKind, StateNode, StateNodeConfig, TransitionDef,
};
pub use error::{ActionError, CoreError, GuardError};
pub use event::{Event, EventDescriptor};
pub use guard::{Guard, GuardExpr};
pub use implementations::Implementations;
pub use macrostep::Macrostep;
pub use resolver::{Microstep, Resolver};
pub use state::{MachineState, StateValue, Status};
