//! Registry mapping action names to step handlers
//!
//! Actions are resolved once, when a manifest is turned into steps.

use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::step::{handler_fn, StepHandler};
use crate::core::errors::{FlowError, Result};

/// Builds a handler from a step's `params`
pub type HandlerFactory = dyn Fn(&Value) -> Result<Arc<dyn StepHandler>> + Send + Sync;

/// Registry for step handlers
#[derive(Clone)]
pub struct HandlerRegistry {
    factories: Arc<RwLock<HashMap<String, Arc<HandlerFactory>>>>,
}

impl HandlerRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registry preloaded with `noop`, `echo`, `sleep` and `fail`
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_factory("noop", |_| {
            Ok(handler_fn(|_, _| async { Ok(json!({"status": "completed"})) }))
        });
        registry.register_factory("echo", |params| {
            let params = params.clone();
            Ok(handler_fn(move |_, inputs| {
                let params = params.clone();
                async move {
                    if params.is_null() {
                        serde_json::to_value(inputs).map_err(anyhow::Error::from)
                    } else {
                        Ok(params)
                    }
                }
            }))
        });
        registry.register_factory("sleep", |params| {
            let ms = params.get("ms").and_then(Value::as_u64).ok_or_else(|| {
                FlowError::configuration_field("sleep requires an integer 'ms' param", "params.ms")
            })?;
            Ok(handler_fn(move |_, _| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({"slept_ms": ms}))
            }))
        });
        registry.register_factory("fail", |params| {
            let message = params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("step failed")
                .to_string();
            Ok(handler_fn(move |_, _| {
                let message = message.clone();
                async move { Err(anyhow::anyhow!(message)) }
            }))
        });
        registry
    }

    /// Register a handler that ignores params
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.register_factory(name, move |_| Ok(handler.clone()));
    }

    /// Register a factory called once per step using the action
    pub fn register_factory<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn StepHandler>> + Send + Sync + 'static,
    {
        self.factories.write().insert(name.into(), Arc::new(factory));
    }

    /// Build the handler for `action` with the given params
    pub fn resolve(&self, action: &str, params: &Value) -> Result<Arc<dyn StepHandler>> {
        let factory = self.factories.read().get(action).cloned().ok_or_else(|| {
            FlowError::configuration_field(format!("unknown action '{}'", action), "action")
        })?;
        factory(params)
    }

    /// Check if an action is registered
    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    /// Registered action names, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
