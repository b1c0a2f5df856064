use crate::core::errors::{FlowError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What a dependent step does when one of its dependencies was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipPolicy {
    /// A skipped dependency blocks its dependents, which stay pending.
    #[default]
    Block,
    /// A skipped dependency counts as satisfied; its result is `null`.
    Unblock,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Graph identifier attached to every status event
    pub graph_id: Option<String>,
    /// Maximum number of steps running at once; `None` means unbounded
    pub max_concurrency: Option<usize>,
    /// Treatment of dependents whose dependency was skipped
    pub skip_policy: SkipPolicy,
    /// Hard cap on handler invocations per step, whatever the retry hooks say
    pub max_attempts: u32,
    /// Emit a `pending` status for every step before the run starts
    pub announce_pending: bool,
    /// Simulated duration for steps with neither handler nor duration
    pub default_step_duration_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            graph_id: None,
            max_concurrency: None,
            skip_policy: SkipPolicy::Block,
            max_attempts: 10,
            announce_pending: false,
            default_step_duration_ms: 0,
        }
    }
}

impl EngineConfig {
    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(limit) = self.max_concurrency {
            if limit == 0 {
                return Err(FlowError::configuration_field(
                    "max_concurrency must be at least 1",
                    "max_concurrency",
                ));
            }
        }
        if self.max_attempts == 0 {
            return Err(FlowError::configuration_field(
                "max_attempts must be at least 1",
                "max_attempts",
            ));
        }
        if let Some(graph_id) = &self.graph_id {
            if graph_id.trim().is_empty() {
                return Err(FlowError::configuration_field(
                    "graph_id must not be blank",
                    "graph_id",
                ));
            }
        }
        Ok(())
    }

    pub fn default_step_duration(&self) -> Duration {
        Duration::from_millis(self.default_step_duration_ms)
    }

    /// Parses and validates a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| FlowError::io(format!("read {}", path.display()), e))?;
        Self::from_yaml_str(&content)
    }

    pub fn with_graph_id(mut self, graph_id: impl Into<String>) -> Self {
        self.graph_id = Some(graph_id.into());
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn with_skip_policy(mut self, policy: SkipPolicy) -> Self {
        self.skip_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.skip_policy, SkipPolicy::Block);
        assert!(config.max_concurrency.is_none());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml_str("max_concurrency: 2\nskip_policy: unblock\n").unwrap();
        assert_eq!(config.max_concurrency, Some(2));
        assert_eq!(config.skip_policy, SkipPolicy::Unblock);
        assert_eq!(config.max_attempts, 10);
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let err = EngineConfig::from_yaml_str("max_concurrency: 0").unwrap_err();
        assert!(matches!(err, FlowError::Configuration { field: Some(ref f), .. } if f == "max_concurrency"));
    }
}
