//! Runtime configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RSTATE_CONFIG)
//! 3. Environment variables

use rstate_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default capacity of snapshot broadcast channels.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Resolver configuration.
    pub engine: EngineConfig,
    /// Actor configuration.
    pub actors: ActorsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RSTATE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        apply_engine_env_overrides(&mut self.engine);
        self.actors.apply_env_overrides();
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_microsteps == 0 {
            return Err(ConfigError::ValidationError(
                "engine.max_microsteps must be greater than 0".to_string(),
            ));
        }
        if self.actors.broadcast_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "actors.broadcast_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn apply_engine_env_overrides(engine: &mut EngineConfig) {
    if let Ok(max) = std::env::var("RSTATE_MAX_MICROSTEPS") {
        if let Ok(n) = max.parse() {
            engine.max_microsteps = n;
        }
    }

    if let Ok(log) = std::env::var("RSTATE_LOG_GUARD_ERRORS") {
        engine.log_guard_errors = log == "1" || log.to_lowercase() == "true";
    }
}

/// Actor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorsConfig {
    /// Capacity of each actor's snapshot broadcast channel.
    pub broadcast_capacity: usize,
}

impl Default for ActorsConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

impl ActorsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(capacity) = std::env::var("RSTATE_BROADCAST_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.broadcast_capacity = n;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine.max_microsteps, 1000);
        assert!(config.engine.log_guard_errors);
        assert_eq!(config.actors.broadcast_capacity, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let parsed: Config = serde_yaml::from_str("engine:\n  max_microsteps: 10\n").unwrap();
        assert_eq!(parsed.engine.max_microsteps, 10);
        assert!(parsed.engine.log_guard_errors);
        assert_eq!(parsed.actors.broadcast_capacity, DEFAULT_BROADCAST_CAPACITY);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rstate.yaml");

        let mut config = Config::default();
        config.engine.max_microsteps = 64;
        config.actors.broadcast_capacity = 8;
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Config::from_file(dir.path().join("nope.yaml"));
        assert!(matches!(missing, Err(ConfigError::IoError(..))));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "engine: [not, a, map]").unwrap();
        assert!(matches!(Config::from_file(&bad), Err(ConfigError::ParseError(..))));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.engine.max_microsteps = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let mut config = Config::default();
        config.actors.broadcast_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("RSTATE_BROADCAST_CAPACITY", "32");
        std::env::set_var("RSTATE_LOG_GUARD_ERRORS", "false");
        let config = Config::from_env();
        std::env::remove_var("RSTATE_BROADCAST_CAPACITY");
        std::env::remove_var("RSTATE_LOG_GUARD_ERRORS");

        assert_eq!(config.actors.broadcast_capacity, 32);
        assert!(!config.engine.log_guard_errors);
    }
}
