//! Core error types.

use thiserror::Error;

/// Errors from the statechart engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid machine definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("duplicate state id: {id}")]
    DuplicateStateId { id: String },

    #[error("unknown target '{target}' in transition from '{source_id}'")]
    UnknownTarget { source_id: String, target: String },

    #[error("unresolved {kind} implementation: '{name}'")]
    UnresolvedImplementation { kind: &'static str, name: String },

    #[error("invalid guard expression: {reason}")]
    InvalidGuard { reason: String },

    #[error("invalid event descriptor: '{descriptor}'")]
    InvalidEventDescriptor { descriptor: String },

    #[error("macrostep did not settle after {limit} microsteps (event '{event}')")]
    MacrostepDivergence { limit: usize, event: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Returns whether this error was raised while building a definition.
    ///
    /// Definition errors are fatal at construction time and never occur once
    /// a machine is running.
    pub fn is_definition_error(&self) -> bool {
        !matches!(self, CoreError::MacrostepDivergence { .. })
    }

    /// Returns an error code suitable for snapshots and logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidDefinition { .. } => "INVALID_DEFINITION",
            CoreError::DuplicateStateId { .. } => "INVALID_DEFINITION",
            CoreError::UnknownTarget { .. } => "INVALID_DEFINITION",
            CoreError::UnresolvedImplementation { .. } => "UNRESOLVED_IMPLEMENTATION",
            CoreError::InvalidGuard { .. } => "INVALID_GUARD",
            CoreError::InvalidEventDescriptor { .. } => "INVALID_DEFINITION",
            CoreError::MacrostepDivergence { .. } => "MACROSTEP_DIVERGENCE",
            CoreError::Json(_) => "BAD_REQUEST",
        }
    }
}

/// A guard implementation failed to produce a verdict.
///
/// The resolver treats a failing guard as `false` and moves on to the next
/// candidate transition.
#[derive(Debug, Clone, Error)]
#[error("guard '{guard}' failed: {message}")]
pub struct GuardError {
    pub guard: String,
    pub message: String,
}

impl GuardError {
    pub fn new(guard: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            guard: guard.into(),
            message: message.into(),
        }
    }
}

/// A custom action failed while executing.
///
/// Aborts the remaining effects of the microstep that produced it; state and
/// context computed for that microstep stay committed.
#[derive(Debug, Clone, Error)]
#[error("action '{action}' failed: {message}")]
pub struct ActionError {
    pub action: String,
    pub message: String,
}

impl ActionError {
    pub fn new(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            message: message.into(),
        }
    }
}
