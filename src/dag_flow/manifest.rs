//! YAML flow manifests
//!
//! ```yaml
//! graph_id: nightly-etl
//! config:
//!   max_concurrency: 4
//! context:
//!   region: eu
//! steps:
//!   - id: extract
//!     action: sleep
//!     params: { ms: 50 }
//!   - id: load
//!     depends_on: [extract]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::callbacks::Callback;
use super::context::ContextBag;
use super::engine::ExecutionEngine;
use super::registry::HandlerRegistry;
use super::step::Step;
use crate::core::config::EngineConfig;
use crate::core::errors::{FlowError, Result};

/// One step as written in a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Registered action name; steps without one only simulate work
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowManifest {
    #[serde(default)]
    pub graph_id: Option<String>,
    #[serde(default)]
    pub config: Option<EngineConfig>,
    /// Initial context bag, a JSON object
    #[serde(default)]
    pub context: Value,
    pub steps: Vec<StepSpec>,
}

impl FlowManifest {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let manifest: Self = serde_yaml::from_str(yaml)?;
        Ok(manifest)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| FlowError::io(format!("read {}", path.display()), e))?;
        Self::from_yaml_str(&content)
    }

    /// The manifest's config; a top-level `graph_id` wins over `config.graph_id`.
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = self.config.clone().unwrap_or_default();
        if self.graph_id.is_some() {
            config.graph_id = self.graph_id.clone();
        }
        config
    }

    pub fn context_bag(&self) -> Result<ContextBag> {
        ContextBag::from_json(self.context.clone())
    }

    /// Resolve every action through the registry
    pub fn to_steps(&self, registry: &HandlerRegistry) -> Result<Vec<Step>> {
        self.steps
            .iter()
            .map(|spec| {
                let mut step = Step::new(spec.id.clone()).depends_on(spec.depends_on.iter().cloned());
                if let Some(action) = &spec.action {
                    let handler = registry.resolve(action, &spec.params).map_err(|e| {
                        FlowError::configuration_field(
                            format!("step '{}': {}", spec.id, e),
                            format!("steps.{}.action", spec.id),
                        )
                    })?;
                    step = step.with_handler(handler);
                }
                if let Some(ms) = spec.duration_ms {
                    step = step.with_duration(Duration::from_millis(ms));
                }
                Ok(step)
            })
            .collect()
    }

    pub fn build_engine(
        &self,
        registry: &HandlerRegistry,
        callbacks: Vec<Arc<dyn Callback>>,
    ) -> Result<ExecutionEngine> {
        let steps = self.to_steps(registry)?;
        debug!(steps = steps.len(), graph_id = ?self.graph_id, "Building engine from manifest");
        ExecutionEngine::new(steps, callbacks, self.engine_config())
    }
}
