//! Events and event descriptors.
//!
//! An event is a `type` tag plus an optional JSON payload:
//!
//! ```json
//! {"type": "PAY", "data": {"amount": 100}}
//! ```
//!
//! Transitions are keyed by descriptors, which are either an exact type,
//! a partial wildcard (`"done.state.*"`) or the full wildcard (`"*"`).

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type of the synthetic event that drives the initial step.
pub const INIT_EVENT: &str = "xstate.init";

/// Prefix of the event raised when a compound or parallel state completes.
pub const DONE_STATE_PREFIX: &str = "done.state.";

/// Prefix of the event a parent receives when a child actor completes.
pub const DONE_INVOKE_PREFIX: &str = "done.invoke.";

/// Prefix of the event a parent receives when a child actor fails.
pub const ERROR_PLATFORM_PREFIX: &str = "error.platform.";

/// An event sent to, or raised inside, a machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Event {
    /// Creates an event without payload.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: Value::Null,
        }
    }

    /// Creates an event carrying a payload.
    pub fn with_data(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }

    pub fn init() -> Self {
        Self::new(INIT_EVENT)
    }

    /// Completion event of a compound or parallel state.
    pub fn done_state(state_id: &str, output: Value) -> Self {
        Self::with_data(format!("{}{}", DONE_STATE_PREFIX, state_id), output)
    }

    /// Completion event of a child actor, delivered to its parent.
    pub fn done_invoke(actor_id: &str, output: Value) -> Self {
        Self::with_data(format!("{}{}", DONE_INVOKE_PREFIX, actor_id), output)
    }

    /// Failure event of a child actor, delivered to its parent.
    pub fn error_platform(actor_id: &str, error: Value) -> Self {
        Self::with_data(format!("{}{}", ERROR_PLATFORM_PREFIX, actor_id), error)
    }

    pub fn is_init(&self) -> bool {
        self.event_type == INIT_EVENT
    }

    pub fn is_error(&self) -> bool {
        self.event_type.starts_with(ERROR_PLATFORM_PREFIX)
    }
}

impl From<&str> for Event {
    fn from(event_type: &str) -> Self {
        Self::new(event_type)
    }
}

impl From<String> for Event {
    fn from(event_type: String) -> Self {
        Self::new(event_type)
    }
}

/// Pattern an event type is matched against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDescriptor {
    /// Matches exactly one event type.
    Exact(String),
    /// Matches every event type starting with the stored dotted prefix
    /// (stored with its trailing dot, e.g. `"done.state."`).
    Prefix(String),
    /// Matches every event type.
    Wildcard,
}

impl EventDescriptor {
    /// Parses a descriptor as written in a definition's `on` map.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CoreError::InvalidEventDescriptor {
                descriptor: s.to_string(),
            });
        }
        if s == "*" {
            return Ok(EventDescriptor::Wildcard);
        }
        if let Some(prefix) = s.strip_suffix(".*") {
            if prefix.is_empty() || prefix.contains('*') {
                return Err(CoreError::InvalidEventDescriptor {
                    descriptor: s.to_string(),
                });
            }
            return Ok(EventDescriptor::Prefix(format!("{}.", prefix)));
        }
        if s.contains('*') {
            return Err(CoreError::InvalidEventDescriptor {
                descriptor: s.to_string(),
            });
        }
        Ok(EventDescriptor::Exact(s.to_string()))
    }

    /// Returns true if the descriptor matches the event type.
    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            EventDescriptor::Exact(t) => t == event_type,
            EventDescriptor::Prefix(p) => event_type.starts_with(p.as_str()),
            EventDescriptor::Wildcard => true,
        }
    }

    /// Ranking used when several descriptors on one node match: exact first,
    /// then longer prefixes, then the wildcard.
    pub fn specificity(&self) -> usize {
        match self {
            EventDescriptor::Exact(_) => usize::MAX,
            EventDescriptor::Prefix(p) => p.len(),
            EventDescriptor::Wildcard => 0,
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            EventDescriptor::Exact(t) => t.clone(),
            EventDescriptor::Prefix(p) => format!("{}*", p),
            EventDescriptor::Wildcard => "*".to_string(),
        }
    }
}
