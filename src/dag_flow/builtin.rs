//! Ready-made callbacks

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::callbacks::{Callback, HookOutcome, HookResult, StepScope};
use super::context::ExecutionContext;

/// Bag key written by [`TimingCallback`], in seconds
pub const TOTAL_EXECUTION_TIME_KEY: &str = "total_execution_time";
/// Bag key written by [`ProgressCallback`], in percent
pub const PROGRESS_PERCENT_KEY: &str = "progress_percent";

/// Routes lifecycle traffic to `tracing`. Runs early.
#[derive(Debug, Default)]
pub struct LoggingCallback;

impl LoggingCallback {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Callback for LoggingCallback {
    fn name(&self) -> &str {
        "logging"
    }

    fn order(&self) -> i32 {
        10
    }

    async fn before_run(&self, ctx: &ExecutionContext) -> HookResult {
        info!(
            run_id = %ctx.run_id,
            graph_id = ctx.graph_id.as_deref().unwrap_or("-"),
            steps = ctx.steps().len(),
            "Starting run"
        );
        Ok(HookOutcome::Continue)
    }

    async fn before_step(&self, _ctx: &ExecutionContext, step: &StepScope) -> HookResult {
        debug!(step = %step.step_id, "Executing step");
        Ok(HookOutcome::Continue)
    }

    async fn after_step(&self, ctx: &ExecutionContext, step: &StepScope) -> HookResult {
        let elapsed = ctx.step_time(&step.step_id).unwrap_or_default();
        debug!(
            step = %step.step_id,
            attempt = step.attempt,
            "Completed step ({:.2}s)",
            elapsed.as_secs_f64()
        );
        Ok(HookOutcome::Continue)
    }

    async fn on_error(
        &self,
        _ctx: &ExecutionContext,
        step: &StepScope,
        err: &anyhow::Error,
    ) -> HookResult {
        error!(step = %step.step_id, attempt = step.attempt, "Error in step: {:#}", err);
        Ok(HookOutcome::Continue)
    }

    async fn on_cancel(&self, ctx: &ExecutionContext) -> HookResult {
        warn!(
            run_id = %ctx.run_id,
            reason = ctx.cancel_reason().as_deref().unwrap_or("-"),
            "Run cancelled"
        );
        Ok(HookOutcome::Continue)
    }

    async fn after_run(&self, ctx: &ExecutionContext) -> HookResult {
        let outcome = if ctx.is_cancelled() {
            "cancelled"
        } else if ctx.has_errors() {
            "failed"
        } else {
            "completed"
        };
        info!(
            run_id = %ctx.run_id,
            graph_id = ctx.graph_id.as_deref().unwrap_or("-"),
            "Run {} ({:.2}s)",
            outcome,
            ctx.elapsed().as_secs_f64()
        );
        Ok(HookOutcome::Continue)
    }
}

/// Stores the wall-clock duration of the run in the context bag.
///
/// Per-step times are kept by the engine itself.
#[derive(Debug, Default)]
pub struct TimingCallback {
    started: Mutex<Option<Instant>>,
}

impl TimingCallback {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Callback for TimingCallback {
    fn name(&self) -> &str {
        "timing"
    }

    fn order(&self) -> i32 {
        5
    }

    async fn before_run(&self, _ctx: &ExecutionContext) -> HookResult {
        *self.started.lock() = Some(Instant::now());
        Ok(HookOutcome::Continue)
    }

    async fn after_run(&self, ctx: &ExecutionContext) -> HookResult {
        let total = self
            .started
            .lock()
            .take()
            .map(|t| t.elapsed())
            .unwrap_or_else(|| ctx.elapsed());
        ctx.bag()
            .insert(TOTAL_EXECUTION_TIME_KEY, &total.as_secs_f64())?;
        Ok(HookOutcome::Continue)
    }
}

type RetryPredicate = dyn Fn(&str, &anyhow::Error) -> bool + Send + Sync;

/// Retries spent by one run
#[derive(Debug, Default)]
struct RunBudget {
    retries: HashMap<String, u32>,
    finished: bool,
}

/// Re-invokes failed handlers up to `max_retries` times per step.
///
/// Budgets are kept per run id, so one instance can serve concurrent runs.
/// A finished run's counters stay readable until the next run starts.
pub struct RetryCallback {
    max_retries: u32,
    delay: Duration,
    retry_if: Option<Arc<RetryPredicate>>,
    runs: Mutex<HashMap<String, RunBudget>>,
}

impl RetryCallback {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            delay: Duration::ZERO,
            retry_if: None,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Wait this long before each retry
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Only retry errors the predicate accepts
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str, &anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    /// Retries spent on a step during run `run_id`
    pub fn retries_for(&self, run_id: &str, step_id: &str) -> u32 {
        self.runs
            .lock()
            .get(run_id)
            .and_then(|budget| budget.retries.get(step_id).copied())
            .unwrap_or(0)
    }
}

impl Default for RetryCallback {
    fn default() -> Self {
        Self::new(3).with_delay(Duration::from_secs(1))
    }
}

#[async_trait]
impl Callback for RetryCallback {
    fn name(&self) -> &str {
        "retry"
    }

    fn order(&self) -> i32 {
        50
    }

    async fn before_run(&self, ctx: &ExecutionContext) -> HookResult {
        let mut runs = self.runs.lock();
        runs.retain(|_, budget| !budget.finished);
        runs.insert(ctx.run_id.clone(), RunBudget::default());
        Ok(HookOutcome::Continue)
    }

    async fn after_run(&self, ctx: &ExecutionContext) -> HookResult {
        if let Some(budget) = self.runs.lock().get_mut(&ctx.run_id) {
            budget.finished = true;
        }
        Ok(HookOutcome::Continue)
    }

    async fn on_error(
        &self,
        ctx: &ExecutionContext,
        step: &StepScope,
        err: &anyhow::Error,
    ) -> HookResult {
        if let Some(predicate) = &self.retry_if {
            if !predicate(&step.step_id, err) {
                return Ok(HookOutcome::Continue);
            }
        }

        let used = {
            let mut runs = self.runs.lock();
            let used = runs
                .entry(ctx.run_id.clone())
                .or_default()
                .retries
                .entry(step.step_id.clone())
                .or_insert(0);
            if *used >= self.max_retries {
                return Ok(HookOutcome::Continue);
            }
            *used += 1;
            *used
        };

        warn!(
            step = %step.step_id,
            retry = used,
            max_retries = self.max_retries,
            "Retrying step after error: {}",
            err
        );
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(HookOutcome::retry(format!(
            "retry {}/{}",
            used, self.max_retries
        )))
    }
}

type ProgressFn = dyn Fn(f64, &str) + Send + Sync;

/// Reports percentage of completed steps. Runs late.
///
/// A step counts once however often its `after_step` hooks run.
pub struct ProgressCallback {
    on_progress: Option<Box<ProgressFn>>,
    completed: Mutex<HashSet<String>>,
}

impl ProgressCallback {
    pub fn new() -> Self {
        Self {
            on_progress: None,
            completed: Mutex::new(HashSet::new()),
        }
    }

    /// Called with `(percent, step_id)` after each successful step
    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(f64, &str) + Send + Sync + 'static,
    {
        self.on_progress = Some(Box::new(f));
        self
    }
}

impl Default for ProgressCallback {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Callback for ProgressCallback {
    fn name(&self) -> &str {
        "progress"
    }

    fn order(&self) -> i32 {
        90
    }

    async fn before_run(&self, _ctx: &ExecutionContext) -> HookResult {
        self.completed.lock().clear();
        Ok(HookOutcome::Continue)
    }

    async fn after_step(&self, ctx: &ExecutionContext, step: &StepScope) -> HookResult {
        let completed = {
            let mut completed = self.completed.lock();
            completed.insert(step.step_id.clone());
            completed.len()
        };
        let total = ctx.steps().len();
        let pct = if total == 0 {
            100.0
        } else {
            (completed as f64 / total as f64 * 100.0).min(100.0)
        };
        if let Some(report) = &self.on_progress {
            report(pct, &step.step_id);
        }
        ctx.bag().insert(PROGRESS_PERCENT_KEY, &pct)?;
        Ok(HookOutcome::Continue)
    }
}

type SkipPredicate = dyn Fn(&ExecutionContext, &StepScope) -> bool + Send + Sync;

/// Skips any step for which the predicate holds
pub struct SkipWhenCallback {
    name: String,
    order: i32,
    predicate: Box<SkipPredicate>,
}

impl SkipWhenCallback {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&ExecutionContext, &StepScope) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            order: 0,
            predicate: Box::new(predicate),
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Skip exactly the named steps
    pub fn steps<I, S>(name: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        Self::new(name, move |_, step| ids.contains(&step.step_id))
    }
}

#[async_trait]
impl Callback for SkipWhenCallback {
    fn name(&self) -> &str {
        &self.name
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn before_step(&self, ctx: &ExecutionContext, step: &StepScope) -> HookResult {
        if (self.predicate)(ctx, step) {
            return Ok(HookOutcome::skip(format!("skipped by {}", self.name)));
        }
        Ok(HookOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag_flow::context::{ContextBag, StepInfo};

    fn ctx(ids: &[&str]) -> ExecutionContext {
        let steps = ids
            .iter()
            .map(|id| StepInfo {
                id: id.to_string(),
                depends_on: Vec::new(),
            })
            .collect();
        ExecutionContext::new(None, steps, ContextBag::new())
    }

    fn scope(id: &str) -> StepScope {
        StepScope {
            step_id: id.to_string(),
            attempt: 1,
            depends_on: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_retry_budget_is_per_step_and_resets() {
        let retry = RetryCallback::new(2);
        let next = ctx(&["a"]);
        let ctx = ctx(&["a", "b"]);
        let err = anyhow::anyhow!("boom");

        for _ in 0..2 {
            let out = retry.on_error(&ctx, &scope("a"), &err).await.unwrap();
            assert!(matches!(out, HookOutcome::Retry(_)));
        }
        let out = retry.on_error(&ctx, &scope("a"), &err).await.unwrap();
        assert_eq!(out, HookOutcome::Continue);
        assert_eq!(retry.retries_for(&ctx.run_id, "a"), 2);
        assert_eq!(retry.retries_for(&ctx.run_id, "b"), 0);

        retry.after_run(&ctx).await.unwrap();
        retry.before_run(&next).await.unwrap();
        assert_eq!(retry.retries_for(&ctx.run_id, "a"), 0);
    }

    #[tokio::test]
    async fn test_concurrent_runs_keep_separate_budgets() {
        let retry = RetryCallback::new(1);
        let first = ctx(&["a"]);
        let second = ctx(&["a"]);
        let err = anyhow::anyhow!("boom");

        retry.before_run(&first).await.unwrap();
        let out = retry.on_error(&first, &scope("a"), &err).await.unwrap();
        assert!(matches!(out, HookOutcome::Retry(_)));

        // a second run starting mid-flight must not refill the first one's budget
        retry.before_run(&second).await.unwrap();
        let out = retry.on_error(&first, &scope("a"), &err).await.unwrap();
        assert_eq!(out, HookOutcome::Continue);
        let out = retry.on_error(&second, &scope("a"), &err).await.unwrap();
        assert!(matches!(out, HookOutcome::Retry(_)));
        assert_eq!(retry.retries_for(&first.run_id, "a"), 1);
        assert_eq!(retry.retries_for(&second.run_id, "a"), 1);
    }

    #[tokio::test]
    async fn test_retry_predicate_filters_errors() {
        let retry = RetryCallback::new(5).retry_if(|_, err| err.to_string().contains("transient"));
        let ctx = ctx(&["a"]);
        let out = retry
            .on_error(&ctx, &scope("a"), &anyhow::anyhow!("fatal"))
            .await
            .unwrap();
        assert_eq!(out, HookOutcome::Continue);
        let out = retry
            .on_error(&ctx, &scope("a"), &anyhow::anyhow!("transient glitch"))
            .await
            .unwrap();
        assert!(matches!(out, HookOutcome::Retry(_)));
    }

    #[tokio::test]
    async fn test_progress_reports_percent() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress = ProgressCallback::new().on_progress(move |pct, id| {
            sink.lock().push((pct, id.to_string()));
        });
        let ctx = ctx(&["a", "b", "c", "d"]);
        progress.before_run(&ctx).await.unwrap();
        progress.after_step(&ctx, &scope("a")).await.unwrap();
        progress.after_step(&ctx, &scope("b")).await.unwrap();

        assert_eq!(*seen.lock(), vec![(25.0, "a".to_string()), (50.0, "b".to_string())]);
        assert_eq!(ctx.bag().get::<f64>(PROGRESS_PERCENT_KEY).unwrap(), Some(50.0));
    }

    #[tokio::test]
    async fn test_progress_counts_a_rerun_step_once() {
        let progress = ProgressCallback::new();
        let ctx = ctx(&["a", "b"]);
        progress.before_run(&ctx).await.unwrap();
        progress.after_step(&ctx, &scope("a")).await.unwrap();
        progress.after_step(&ctx, &scope("a")).await.unwrap();
        assert_eq!(ctx.bag().get::<f64>(PROGRESS_PERCENT_KEY).unwrap(), Some(50.0));

        progress.after_step(&ctx, &scope("b")).await.unwrap();
        assert_eq!(ctx.bag().get::<f64>(PROGRESS_PERCENT_KEY).unwrap(), Some(100.0));
    }

    #[tokio::test]
    async fn test_timing_writes_total() {
        let timing = TimingCallback::new();
        let ctx = ctx(&[]);
        timing.before_run(&ctx).await.unwrap();
        timing.after_run(&ctx).await.unwrap();
        let total: f64 = ctx.bag().get(TOTAL_EXECUTION_TIME_KEY).unwrap().unwrap();
        assert!(total >= 0.0);
    }

    #[tokio::test]
    async fn test_skip_when_named_steps() {
        let skip = SkipWhenCallback::steps("skip-b", ["b"]);
        let ctx = ctx(&["a", "b"]);
        assert_eq!(skip.before_step(&ctx, &scope("a")).await.unwrap(), HookOutcome::Continue);
        assert_eq!(
            skip.before_step(&ctx, &scope("b")).await.unwrap(),
            HookOutcome::skip("skipped by skip-b")
        );
    }
}
