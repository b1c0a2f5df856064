//! Steps and their handlers
//!
//! A step is a named unit of work with declared dependencies. Its handler
//! receives the run's context bag and the results of its dependencies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::context::ContextBag;

/// Results of a step's dependencies, keyed by dependency id
pub type StepInputs = HashMap<String, Value>;

/// The work a step performs
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Run the step. Called concurrently with other steps' handlers.
    async fn call(&self, bag: &ContextBag, inputs: &StepInputs) -> anyhow::Result<Value>;
}

/// Wraps an async closure as a [`StepHandler`]
pub struct FnHandler<F> {
    func: F,
}

impl<F> FnHandler<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(ContextBag, StepInputs) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, bag: &ContextBag, inputs: &StepInputs) -> anyhow::Result<Value> {
        (self.func)(bag.clone(), inputs.clone()).await
    }
}

/// Shorthand for `Arc::new(FnHandler::new(func))`
pub fn handler_fn<F, Fut>(func: F) -> Arc<dyn StepHandler>
where
    F: Fn(ContextBag, StepInputs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler::new(func))
}

/// A named unit of work
#[derive(Clone)]
pub struct Step {
    pub id: String,
    pub depends_on: Vec<String>,
    pub handler: Option<Arc<dyn StepHandler>>,
    /// Simulated duration used when there is no handler
    pub duration: Option<Duration>,
}

impl Step {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            handler: None,
            duration: None,
        }
    }

    /// Add dependencies
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn StepHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set an async closure as the handler
    pub fn with_fn<F, Fut>(self, func: F) -> Self
    where
        F: Fn(ContextBag, StepInputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.with_handler(handler_fn(func))
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("depends_on", &self.depends_on)
            .field("handler", &self.handler.as_ref().map(|_| "<handler>"))
            .field("duration", &self.duration)
            .finish()
    }
}

/// Per-step execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Status string used on the wire
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Pending | Self::Ready => "pending",
            Self::Running => "running",
            Self::Succeeded => "success",
            Self::Failed => "error",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Run-level execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}
