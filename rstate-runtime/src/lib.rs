//! # rstate-runtime
//!
//! Actor runtime for rstate.
//!
//! This crate provides:
//! - Machine actors that run definitions from `rstate-core`
//! - Task actors for asynchronous work on tokio
//! - FIFO mailboxes with buffering before start
//! - Snapshots, callback subscriptions and broadcast streams
//! - Configuration loading

pub mod actor;
pub mod config;
pub mod error;
pub mod logic;
pub mod machine;
pub mod mailbox;
pub mod snapshot;
pub mod subscription;
mod task;

pub use actor::{ActorRef, ActorStatus};
pub use config::{ActorsConfig, Config, ConfigError};
pub use error::{ActorError, RuntimeError};
pub use logic::{ActorLogic, MachineLogic, MachineOptions, TaskFn, TaskOutcome};
pub use machine::Machine;
pub use snapshot::Snapshot;
pub use subscription::Subscription;

pub use rstate_core::{Event, StateValue, Status};
