use serde::{Deserialize, Serialize};
use std::{
    fs::{read_to_string, write},
    path::Path,
};

use crate::{error::PatternError, properties::AccessPriority};

pub const DEFAULT_DISPATCH_THREAD: &str = "resource-dispatch";
pub const DEFAULT_QUEUE_WARN_THRESHOLD: usize = 10_000;

/// Settings of the notification dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub thread_name: String,
    /// A warning is logged whenever the backlog of undelivered jobs grows past this size.
    pub queue_warn_threshold: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            thread_name: DEFAULT_DISPATCH_THREAD.to_string(),
            queue_warn_threshold: DEFAULT_QUEUE_WARN_THRESHOLD,
        }
    }
}

/// Settings of the pattern matcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Priority used by demands registered without an explicit priority.
    pub default_priority: AccessPriority,
    /// Debug-log every available/unavailable transition.
    pub log_transitions: bool,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        MatcherConfig {
            default_priority: AccessPriority::Lowest,
            log_transitions: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dispatcher: DispatcherConfig,
    pub matcher: MatcherConfig,
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<EngineConfig, PatternError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the configuration at `path`. A missing file yields the default configuration.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<EngineConfig, PatternError> {
        tracing::debug!("Attempting to read engine config from: {:?}", path.as_ref());
        if !path.as_ref().exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(EngineConfig::default());
        }
        let content = read_to_string(path)?;
        EngineConfig::from_toml_str(&content)
    }

    pub fn to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), PatternError> {
        tracing::debug!("Attempting to write engine config to: {:?}", path.as_ref());
        let toml_string = toml::to_string(self)?;
        write(path, toml_string)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), PatternError> {
        if self.dispatcher.thread_name.trim().is_empty() {
            return Err(PatternError::Config(
                "dispatcher.thread_name must not be empty".to_string(),
            ));
        }
        if self.dispatcher.queue_warn_threshold == 0 {
            return Err(PatternError::Config(
                "dispatcher.queue_warn_threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
[matcher]
default_priority = "device_specific"
"#,
        )
        .unwrap();
        assert_eq!(
            config.matcher.default_priority,
            AccessPriority::DeviceSpecific
        );
        assert!(config.matcher.log_transitions);
        assert_eq!(config.dispatcher, DispatcherConfig::default());
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let err = EngineConfig::from_toml_str("[dispatcher]\nqueue_warn_threshold = 0\n").unwrap_err();
        assert!(matches!(err, PatternError::Config(_)));
        let err = EngineConfig::from_toml_str("[matcher]\ndefault_priority = 3\n").unwrap_err();
        assert!(matches!(err, PatternError::Serialization(_)));
    }

    #[test]
    fn round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        assert_eq!(EngineConfig::from_path(&path).unwrap(), EngineConfig::default());

        let mut config = EngineConfig::default();
        config.dispatcher.thread_name = "dispatch-test".to_string();
        config.matcher.log_transitions = false;
        config.to_path(&path).unwrap();
        assert_eq!(EngineConfig::from_path(&path).unwrap(), config);
    }
}
