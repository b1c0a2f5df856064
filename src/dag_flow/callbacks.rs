//! Two-way hook system for step execution
//!
//! Hooks read and mutate the run's [`ExecutionContext`] at each extension
//! point and steer execution by returning a [`HookOutcome`]. Returning an
//! error is a programming fault and aborts the run.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::context::ExecutionContext;
use crate::core::errors::{FlowError, HookPoint, Result};

/// What a hook wants the engine to do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Continue,
    Skip(String),
    Retry(String),
    Cancel(String),
}

impl HookOutcome {
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip(reason.into())
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry(reason.into())
    }

    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::Cancel(reason.into())
    }

    pub fn is_continue(&self) -> bool {
        matches!(self, Self::Continue)
    }

    fn signal_name(&self) -> &'static str {
        match self {
            Self::Continue => "Continue",
            Self::Skip(_) => "Skip",
            Self::Retry(_) => "Retry",
            Self::Cancel(_) => "Cancel",
        }
    }
}

impl fmt::Display for HookOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => f.write_str("Continue"),
            Self::Skip(r) | Self::Retry(r) | Self::Cancel(r) => {
                write!(f, "{}({})", self.signal_name(), r)
            }
        }
    }
}

/// `Ok` carries a control signal, `Err` is a hook fault.
pub type HookResult = anyhow::Result<HookOutcome>;

/// The step a step-level hook is invoked for
#[derive(Debug, Clone)]
pub struct StepScope {
    pub step_id: String,
    /// 1-based handler invocation count; 0 before the first invocation
    pub attempt: u32,
    pub depends_on: Vec<String>,
}

/// A dependency edge being traversed into `target`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeScope {
    pub source: String,
    pub target: String,
}

/// Lifecycle hooks around a run and each of its steps.
///
/// Every method defaults to `Continue`. Lower `order` values run first.
#[async_trait]
pub trait Callback: Send + Sync {
    fn name(&self) -> &str;

    fn order(&self) -> i32 {
        0
    }

    /// Once, before any step is dispatched. Accepts `Cancel`.
    async fn before_run(&self, _ctx: &ExecutionContext) -> HookResult {
        Ok(HookOutcome::Continue)
    }

    /// Once, after the run settles (completed or cancelled).
    async fn after_run(&self, _ctx: &ExecutionContext) -> HookResult {
        Ok(HookOutcome::Continue)
    }

    /// Before the handler runs. Accepts `Skip` and `Cancel`.
    async fn before_step(&self, _ctx: &ExecutionContext, _step: &StepScope) -> HookResult {
        Ok(HookOutcome::Continue)
    }

    /// After a successful handler call; the result is already recorded and
    /// may be rewritten with [`ExecutionContext::set_result`].
    async fn after_step(&self, _ctx: &ExecutionContext, _step: &StepScope) -> HookResult {
        Ok(HookOutcome::Continue)
    }

    /// After a failed handler call.
    async fn on_error(
        &self,
        _ctx: &ExecutionContext,
        _step: &StepScope,
        _error: &anyhow::Error,
    ) -> HookResult {
        Ok(HookOutcome::Continue)
    }

    /// Once, when the run has been cancelled, before `after_run`.
    async fn on_cancel(&self, _ctx: &ExecutionContext) -> HookResult {
        Ok(HookOutcome::Continue)
    }

    /// Before an edge from a succeeded dependency becomes active, once the
    /// target's `before_step` hooks have let it run.
    async fn before_edge(&self, _ctx: &ExecutionContext, _edge: &EdgeScope) -> HookResult {
        Ok(HookOutcome::Continue)
    }

    /// After an active edge settles with its target.
    async fn after_edge(&self, _ctx: &ExecutionContext, _edge: &EdgeScope) -> HookResult {
        Ok(HookOutcome::Continue)
    }
}

fn accepts(point: HookPoint, outcome: &HookOutcome) -> bool {
    match (point, outcome) {
        (_, HookOutcome::Continue) => true,
        (HookPoint::BeforeRun, HookOutcome::Cancel(_)) => true,
        (HookPoint::BeforeStep, HookOutcome::Skip(_) | HookOutcome::Cancel(_)) => true,
        (HookPoint::AfterStep | HookPoint::OnError, _) => true,
        _ => false,
    }
}

/// Turns one hook's result into either "keep going" or a signal for the engine
fn settle(
    callback: &dyn Callback,
    point: HookPoint,
    step: Option<&str>,
    result: HookResult,
) -> Result<Option<HookOutcome>> {
    let outcome =
        result.map_err(|source| FlowError::hook_fault(callback.name(), point, step, source))?;
    if !accepts(point, &outcome) {
        return Err(FlowError::unsupported_signal(
            callback.name(),
            point,
            outcome.to_string(),
        ));
    }
    if outcome.is_continue() {
        return Ok(None);
    }
    debug!(
        hook = callback.name(),
        %point,
        step = step.unwrap_or("-"),
        signal = %outcome,
        "Hook raised control signal"
    );
    Ok(Some(outcome))
}

/// Callbacks sorted by ascending order key; ties keep insertion order.
#[derive(Clone, Default)]
pub struct CallbackChain {
    callbacks: Vec<Arc<dyn Callback>>,
}

impl CallbackChain {
    pub fn new(callbacks: Vec<Arc<dyn Callback>>) -> Self {
        let mut chain = Self { callbacks };
        chain.callbacks.sort_by_key(|cb| cb.order());
        chain
    }

    pub fn push(&mut self, callback: Arc<dyn Callback>) {
        self.callbacks.push(callback);
        self.callbacks.sort_by_key(|cb| cb.order());
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Callback names in invocation order
    pub fn names(&self) -> Vec<String> {
        self.callbacks.iter().map(|cb| cb.name().to_string()).collect()
    }

    pub async fn before_run(&self, ctx: &ExecutionContext) -> Result<HookOutcome> {
        for cb in &self.callbacks {
            let result = cb.before_run(ctx).await;
            if let Some(signal) = settle(cb.as_ref(), HookPoint::BeforeRun, None, result)? {
                return Ok(signal);
            }
        }
        Ok(HookOutcome::Continue)
    }

    pub async fn after_run(&self, ctx: &ExecutionContext) -> Result<()> {
        for cb in &self.callbacks {
            let result = cb.after_run(ctx).await;
            settle(cb.as_ref(), HookPoint::AfterRun, None, result)?;
        }
        Ok(())
    }

    pub async fn on_cancel(&self, ctx: &ExecutionContext) -> Result<()> {
        for cb in &self.callbacks {
            let result = cb.on_cancel(ctx).await;
            settle(cb.as_ref(), HookPoint::OnCancel, None, result)?;
        }
        Ok(())
    }

    pub async fn before_step(
        &self,
        ctx: &ExecutionContext,
        step: &StepScope,
    ) -> Result<HookOutcome> {
        for cb in &self.callbacks {
            let result = cb.before_step(ctx, step).await;
            if let Some(signal) =
                settle(cb.as_ref(), HookPoint::BeforeStep, Some(&step.step_id), result)?
            {
                return Ok(signal);
            }
        }
        Ok(HookOutcome::Continue)
    }

    pub async fn after_step(&self, ctx: &ExecutionContext, step: &StepScope) -> Result<HookOutcome> {
        for cb in &self.callbacks {
            let result = cb.after_step(ctx, step).await;
            if let Some(signal) =
                settle(cb.as_ref(), HookPoint::AfterStep, Some(&step.step_id), result)?
            {
                return Ok(signal);
            }
        }
        Ok(HookOutcome::Continue)
    }

    pub async fn before_edge(&self, ctx: &ExecutionContext, edge: &EdgeScope) -> Result<()> {
        for cb in &self.callbacks {
            let result = cb.before_edge(ctx, edge).await;
            settle(cb.as_ref(), HookPoint::BeforeEdge, Some(&edge.target), result)?;
        }
        Ok(())
    }

    pub async fn after_edge(&self, ctx: &ExecutionContext, edge: &EdgeScope) -> Result<()> {
        for cb in &self.callbacks {
            let result = cb.after_edge(ctx, edge).await;
            settle(cb.as_ref(), HookPoint::AfterEdge, Some(&edge.target), result)?;
        }
        Ok(())
    }

    pub async fn on_error(
        &self,
        ctx: &ExecutionContext,
        step: &StepScope,
        error: &anyhow::Error,
    ) -> Result<HookOutcome> {
        for cb in &self.callbacks {
            let result = cb.on_error(ctx, step, error).await;
            if let Some(signal) =
                settle(cb.as_ref(), HookPoint::OnError, Some(&step.step_id), result)?
            {
                return Ok(signal);
            }
        }
        Ok(HookOutcome::Continue)
    }
}

impl fmt::Debug for CallbackChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
