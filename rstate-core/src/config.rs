//! Engine tuning knobs.

use serde::{Deserialize, Serialize};

/// Default bound on microsteps per macrostep.
pub const DEFAULT_MAX_MICROSTEPS: usize = 1000;

/// Resolver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Microsteps allowed in a single macrostep before it is declared divergent.
    pub max_microsteps: usize,
    /// Whether failing guards are logged at warn level.
    pub log_guard_errors: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_microsteps: DEFAULT_MAX_MICROSTEPS,
            log_guard_errors: true,
        }
    }
}

impl EngineConfig {
    pub fn with_max_microsteps(mut self, limit: usize) -> Self {
        self.max_microsteps = limit;
        self
    }
}
