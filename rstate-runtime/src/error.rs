//! Runtime error types.

use crate::config::ConfigError;
use rstate_core::{ActionError, CoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("action error: {0}")]
    Action(#[from] ActionError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("actor '{actor_id}' needs an async runtime but none is running")]
    NoAsyncRuntime { actor_id: String },

    #[error("no actor logic registered for '{src}'")]
    UnknownActor { src: String },
}

impl RuntimeError {
    /// Returns an error code suitable for snapshots and logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            RuntimeError::Core(e) => e.error_code(),
            RuntimeError::Config(_) => "INVALID_CONFIG",
            RuntimeError::Action(_) => "ACTION_FAILED",
            RuntimeError::Json(_) => "BAD_REQUEST",
            RuntimeError::Io(_) => "IO_ERROR",
            RuntimeError::NoAsyncRuntime { .. } => "NO_ASYNC_RUNTIME",
            RuntimeError::UnknownActor { .. } => "UNRESOLVED_IMPLEMENTATION",
        }
    }
}

/// Failure of a child actor, delivered to its parent as the payload of an
/// `error.platform.<id>` event.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("actor '{actor_id}' failed: {message}")]
pub struct ActorError {
    pub actor_id: String,
    pub message: String,
}

impl ActorError {
    pub fn new(actor_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            message: message.into(),
        }
    }

    /// Error without an actor id; the runtime fills it in on delivery.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(String::new(), message)
    }

    pub(crate) fn for_actor(mut self, actor_id: &str) -> Self {
        if self.actor_id.is_empty() {
            self.actor_id = actor_id.to_string();
        }
        self
    }

    pub(crate) fn to_value(&self) -> serde_json::Value {
        serde_json::json!({"actor_id": self.actor_id, "message": self.message})
    }
}
