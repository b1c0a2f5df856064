//! Level-by-level step execution
//!
//! Every ready step of a level is driven concurrently on the current task
//! (`FuturesUnordered`), optionally throttled by a semaphore. The next level
//! starts once the whole level has settled, so a step's result is visible
//! to its dependents only after its `after_step` hooks have run.

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::callbacks::{Callback, CallbackChain, EdgeScope, HookOutcome, StepScope};
use super::context::{ContextBag, ExecutionContext, StepInfo};
use super::events::{ChannelEventSink, EventEnvelope, EventSink, StatusEmitter};
use super::graph::StepGraph;
use super::step::{RunStatus, Step, StepInputs, StepStatus};
use crate::core::config::{EngineConfig, SkipPolicy};
use crate::core::errors::{FlowError, Result};

const COMPLETE_MESSAGE: &str = "Execution completed successfully";

/// Outcome of a finished run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    pub step_statuses: HashMap<String, StepStatus>,
    /// Steps never dispatched, in declaration order
    pub blocked: Vec<String>,
    /// Handler invocations per step
    pub attempts: HashMap<String, u32>,
    pub context: Arc<ExecutionContext>,
}

impl RunReport {
    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.step_statuses.get(step_id).copied()
    }

    pub fn attempts(&self, step_id: &str) -> u32 {
        self.attempts.get(step_id).copied().unwrap_or(0)
    }

    pub fn result(&self, step_id: &str) -> Option<Value> {
        self.context.result(step_id)
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// A run executing on its own task
pub struct RunStream {
    pub events: mpsc::UnboundedReceiver<EventEnvelope>,
    /// Shared with the running task; call `cancel` to stop it
    pub context: Arc<ExecutionContext>,
    pub handle: JoinHandle<Result<RunReport>>,
}

/// How one step finished
struct Settled {
    status: StepStatus,
    message: Option<String>,
}

impl Settled {
    fn new(status: StepStatus, message: Option<String>) -> Self {
        Self { status, message }
    }
}

pub struct ExecutionEngine {
    graph: Arc<StepGraph>,
    chain: CallbackChain,
    config: EngineConfig,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl ExecutionEngine {
    /// Validates configuration and the step graph; nothing runs on failure.
    pub fn new(
        steps: Vec<Step>,
        callbacks: Vec<Arc<dyn Callback>>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let graph = StepGraph::build(steps)?;
        Ok(Self {
            graph: Arc::new(graph),
            chain: CallbackChain::new(callbacks),
            config,
            sinks: Vec::new(),
        })
    }

    /// Deliver status events of every run to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    pub fn chain(&self) -> &CallbackChain {
        &self.chain
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A fresh context for one run of this engine
    pub fn new_context(&self, bag: ContextBag) -> ExecutionContext {
        let steps = self
            .graph
            .steps()
            .iter()
            .map(|s| StepInfo {
                id: s.id.clone(),
                depends_on: s.depends_on.clone(),
            })
            .collect();
        ExecutionContext::new(self.config.graph_id.clone(), steps, bag)
    }

    pub async fn run(&self, bag: ContextBag) -> Result<RunReport> {
        let ctx = Arc::new(self.new_context(bag));
        self.run_with_context(ctx).await
    }

    /// Run with a caller-held context, e.g. to cancel from another task
    pub async fn run_with_context(&self, ctx: Arc<ExecutionContext>) -> Result<RunReport> {
        self.execute(ctx, None).await
    }

    /// Spawn the run on tokio and stream its events
    pub fn stream(self: Arc<Self>, bag: ContextBag) -> RunStream {
        let (sink, events) = ChannelEventSink::channel();
        let ctx = Arc::new(self.new_context(bag));
        let run_ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            self.execute(run_ctx, Some(Arc::new(sink) as Arc<dyn EventSink>))
                .await
        });
        RunStream {
            events,
            context: ctx,
            handle,
        }
    }

    async fn execute(
        &self,
        ctx: Arc<ExecutionContext>,
        extra_sink: Option<Arc<dyn EventSink>>,
    ) -> Result<RunReport> {
        if ctx.status() != RunStatus::Idle {
            return Err(FlowError::internal(format!(
                "context of run {} has already been used",
                ctx.run_id
            )));
        }

        let mut sinks = self.sinks.clone();
        sinks.extend(extra_sink);
        let emitter = StatusEmitter::new(
            ctx.run_id.clone(),
            self.config.graph_id.clone(),
            self.graph.steps().iter().map(|s| s.id.clone()),
            sinks,
        );

        ctx.set_status(RunStatus::Running);
        info!(
            run_id = %ctx.run_id,
            steps = self.graph.len(),
            levels = self.graph.levels().len(),
            "Run started"
        );

        if self.config.announce_pending {
            for step in self.graph.steps() {
                emitter.node_status(&step.id, StepStatus::Pending, None)?;
            }
        }

        match self.chain.before_run(&ctx).await {
            Ok(HookOutcome::Cancel(reason)) => {
                ctx.cancel(reason);
            }
            Ok(_) => {}
            Err(fault) => return Err(self.abort(&ctx, &emitter, fault)),
        }

        let limiter = self.config.max_concurrency.map(Semaphore::new);
        let halted = AtomicBool::new(false);
        let mut fault: Option<FlowError> = None;

        for (level, ids) in self.graph.levels().iter().enumerate() {
            if ctx.is_cancelled() || fault.is_some() {
                break;
            }

            let ready: Vec<&Step> = ids
                .iter()
                .filter_map(|id| self.graph.step(id))
                .filter(|step| self.is_ready(&ctx, step))
                .collect();
            debug!(level, ready = ready.len(), of = ids.len(), "Dispatching level");

            for step in &ready {
                ctx.set_step_status(&step.id, StepStatus::Ready);
            }

            let mut in_flight: FuturesUnordered<_> = ready
                .iter()
                .map(|step| self.drive_step(&ctx, &emitter, step, limiter.as_ref(), &halted))
                .collect();

            while let Some(outcome) = in_flight.next().await {
                if let Err(err) = outcome {
                    halted.store(true, Ordering::SeqCst);
                    error!(run_id = %ctx.run_id, "Stopping run: {}", err);
                    fault.get_or_insert(err);
                }
            }
        }

        if let Some(fault) = fault {
            return Err(self.abort(&ctx, &emitter, fault));
        }

        if ctx.is_cancelled() {
            ctx.set_status(RunStatus::Cancelled);
            let reason = ctx
                .cancel_reason()
                .unwrap_or_else(|| "cancelled".to_string());
            warn!(run_id = %ctx.run_id, %reason, "Run cancelled");
            if let Err(fault) = self.chain.on_cancel(&ctx).await {
                return Err(self.abort(&ctx, &emitter, fault));
            }
            if let Err(fault) = self.chain.after_run(&ctx).await {
                return Err(self.abort(&ctx, &emitter, fault));
            }
            emitter.error(format!("Execution cancelled: {}", reason), None)?;
        } else {
            ctx.set_status(RunStatus::Completed);
            if let Err(fault) = self.chain.after_run(&ctx).await {
                return Err(self.abort(&ctx, &emitter, fault));
            }
            emitter.complete(ctx.results(), Some(COMPLETE_MESSAGE.to_string()))?;
        }

        let report = self.report(ctx);
        info!(
            run_id = %report.context.run_id,
            status = %report.status,
            blocked = report.blocked.len(),
            "Run finished"
        );
        Ok(report)
    }

    /// Every dependency has succeeded, or was skipped under `Unblock`.
    fn is_ready(&self, ctx: &ExecutionContext, step: &Step) -> bool {
        step.depends_on
            .iter()
            .all(|dep| match ctx.step_status(dep) {
                Some(StepStatus::Succeeded) => true,
                Some(StepStatus::Skipped) => self.config.skip_policy == SkipPolicy::Unblock,
                _ => false,
            })
    }

    /// Marks the run failed and emits the terminal error event
    fn abort(&self, ctx: &ExecutionContext, emitter: &StatusEmitter, fault: FlowError) -> FlowError {
        ctx.set_status(RunStatus::Failed);
        let step = match &fault {
            FlowError::HookFault { step, .. } => step.clone(),
            _ => None,
        };
        let step = step.filter(|id| ctx.has_step(id));
        if let Err(err) = emitter.error(fault.to_string(), step.as_deref()) {
            warn!("Could not emit run error event: {}", err);
        }
        fault
    }

    fn report(&self, ctx: Arc<ExecutionContext>) -> RunReport {
        let step_statuses = ctx.step_statuses();
        let blocked = self
            .graph
            .steps()
            .iter()
            .filter(|s| {
                matches!(
                    step_statuses.get(&s.id),
                    Some(StepStatus::Pending | StepStatus::Ready)
                )
            })
            .map(|s| s.id.clone())
            .collect();
        RunReport {
            status: ctx.status(),
            step_statuses,
            blocked,
            attempts: ctx.all_attempts(),
            context: ctx,
        }
    }

    #[instrument(skip_all, fields(step = %step.id))]
    async fn drive_step(
        &self,
        ctx: &ExecutionContext,
        emitter: &StatusEmitter,
        step: &Step,
        limiter: Option<&Semaphore>,
        halted: &AtomicBool,
    ) -> Result<()> {
        let _permit = match limiter {
            Some(semaphore) => Some(
                semaphore
                    .acquire()
                    .await
                    .map_err(|e| FlowError::internal(format!("concurrency limiter closed: {e}")))?,
            ),
            None => None,
        };

        if ctx.is_cancelled() || halted.load(Ordering::SeqCst) {
            ctx.set_step_status(&step.id, StepStatus::Pending);
            return Ok(());
        }

        let mut scope = StepScope {
            step_id: step.id.clone(),
            attempt: 0,
            depends_on: step.depends_on.clone(),
        };

        let outcome = match self.chain.before_step(ctx, &scope).await {
            Ok(outcome) => outcome,
            Err(fault) => {
                ctx.set_step_status(&step.id, StepStatus::Pending);
                return Err(fault);
            }
        };
        match outcome {
            HookOutcome::Continue => {}
            HookOutcome::Skip(reason) => {
                debug!(%reason, "Step skipped before start");
                let settled = Settled::new(StepStatus::Skipped, Some(reason));
                return self.finish(ctx, emitter, step, &[], settled).await;
            }
            HookOutcome::Cancel(reason) => {
                ctx.set_step_status(&step.id, StepStatus::Pending);
                ctx.cancel(reason);
                return Ok(());
            }
            HookOutcome::Retry(reason) => {
                return Err(FlowError::internal(format!(
                    "retry '{}' reached the engine before step '{}' started",
                    reason, step.id
                )));
            }
        }

        // A concurrent step may have cancelled while our hooks ran
        if ctx.is_cancelled() || halted.load(Ordering::SeqCst) {
            ctx.set_step_status(&step.id, StepStatus::Pending);
            return Ok(());
        }

        // Skipped dependencies never activate their edge
        let active: Vec<EdgeScope> = step
            .depends_on
            .iter()
            .filter(|dep| ctx.step_status(dep) == Some(StepStatus::Succeeded))
            .map(|dep| EdgeScope {
                source: dep.clone(),
                target: step.id.clone(),
            })
            .collect();
        for edge in &active {
            if let Err(fault) = self.chain.before_edge(ctx, edge).await {
                ctx.set_step_status(&step.id, StepStatus::Pending);
                return Err(fault);
            }
        }
        for edge in &active {
            emitter.edge_active(&edge.source, &edge.target)?;
        }
        ctx.set_step_status(&step.id, StepStatus::Running);
        emitter.node_status(&step.id, StepStatus::Running, None)?;

        match self.attempt_loop(ctx, step, &mut scope).await {
            Ok(settled) => self.finish(ctx, emitter, step, &active, settled).await,
            Err(fault) => {
                let settled = Settled::new(StepStatus::Failed, Some(fault.to_string()));
                if let Err(err) = self.finish(ctx, emitter, step, &active, settled).await {
                    warn!("Could not settle faulted step: {}", err);
                }
                Err(fault)
            }
        }
    }

    /// Invoke the handler until the hooks stop asking for retries
    async fn attempt_loop(
        &self,
        ctx: &ExecutionContext,
        step: &Step,
        scope: &mut StepScope,
    ) -> Result<Settled> {
        let inputs: StepInputs = step
            .depends_on
            .iter()
            .map(|dep| (dep.clone(), ctx.result(dep).unwrap_or(Value::Null)))
            .collect();
        let started = Instant::now();

        loop {
            scope.attempt = ctx.next_attempt(&step.id);
            let outcome = self.invoke(ctx, step, &inputs).await;
            ctx.record_step_time(&step.id, started.elapsed());

            match outcome {
                Ok(value) => {
                    ctx.set_result(&step.id, value)?;
                    ctx.clear_error(&step.id);
                    match self.chain.after_step(ctx, scope).await? {
                        HookOutcome::Continue => {
                            return Ok(Settled::new(StepStatus::Succeeded, None));
                        }
                        HookOutcome::Retry(reason) => {
                            if self.attempts_exhausted(scope) {
                                return Ok(Settled::new(StepStatus::Succeeded, None));
                            }
                            debug!(attempt = scope.attempt, %reason, "Re-running step");
                            ctx.remove_result(&step.id);
                        }
                        HookOutcome::Skip(reason) => {
                            ctx.remove_result(&step.id);
                            return Ok(Settled::new(StepStatus::Skipped, Some(reason)));
                        }
                        HookOutcome::Cancel(reason) => {
                            ctx.cancel(reason);
                            return Ok(Settled::new(StepStatus::Succeeded, None));
                        }
                    }
                }
                Err(err) => {
                    let message = format!("{:#}", err);
                    ctx.record_error(&step.id, message.clone());
                    match self.chain.on_error(ctx, scope, &err).await? {
                        HookOutcome::Continue => {
                            warn!(attempt = scope.attempt, "Step failed: {}", message);
                            return Ok(Settled::new(StepStatus::Failed, Some(message)));
                        }
                        HookOutcome::Retry(reason) => {
                            if self.attempts_exhausted(scope) {
                                return Ok(Settled::new(StepStatus::Failed, Some(message)));
                            }
                            debug!(attempt = scope.attempt, %reason, "Retrying step");
                        }
                        HookOutcome::Skip(reason) => {
                            ctx.clear_error(&step.id);
                            return Ok(Settled::new(StepStatus::Skipped, Some(reason)));
                        }
                        HookOutcome::Cancel(reason) => {
                            ctx.cancel(reason);
                            return Ok(Settled::new(StepStatus::Failed, Some(message)));
                        }
                    }
                }
            }
        }
    }

    fn attempts_exhausted(&self, scope: &StepScope) -> bool {
        let exhausted = scope.attempt >= self.config.max_attempts;
        if exhausted {
            warn!(
                attempts = scope.attempt,
                max_attempts = self.config.max_attempts,
                "Ignoring retry, step reached the attempt limit"
            );
        }
        exhausted
    }

    async fn invoke(
        &self,
        ctx: &ExecutionContext,
        step: &Step,
        inputs: &StepInputs,
    ) -> anyhow::Result<Value> {
        match &step.handler {
            Some(handler) => handler.call(ctx.bag(), inputs).await,
            None => {
                let duration = step
                    .duration
                    .unwrap_or_else(|| self.config.default_step_duration());
                if !duration.is_zero() {
                    tokio::time::sleep(duration).await;
                }
                Ok(json!({"status": "completed"}))
            }
        }
    }

    /// Record the terminal state and settle the edges that were activated
    async fn finish(
        &self,
        ctx: &ExecutionContext,
        emitter: &StatusEmitter,
        step: &Step,
        active: &[EdgeScope],
        settled: Settled,
    ) -> Result<()> {
        ctx.set_step_status(&step.id, settled.status);
        emitter.node_status(&step.id, settled.status, settled.message)?;
        for edge in active {
            emitter.edge_settled(&edge.source, &edge.target, settled.status)?;
            self.chain.after_edge(ctx, edge).await?;
        }
        debug!(status = %settled.status, "Step settled");
        Ok(())
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("steps", &self.graph.len())
            .field("callbacks", &self.chain)
            .field("config", &self.config)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag_flow::events::BufferingEventSink;

    #[tokio::test]
    async fn test_handlerless_steps_complete() {
        let engine = ExecutionEngine::new(
            vec![Step::new("a"), Step::new("b").depends_on(["a"])],
            Vec::new(),
            EngineConfig::default(),
        )
        .unwrap();
        let report = engine.run(ContextBag::new()).await.unwrap();
        assert!(report.is_completed());
        assert_eq!(report.result("b"), Some(json!({"status": "completed"})));
        assert_eq!(report.attempts("a"), 1);
        assert!(report.blocked.is_empty());
    }

    #[tokio::test]
    async fn test_failed_dependency_blocks_dependents() {
        let sink = Arc::new(BufferingEventSink::new());
        let engine = ExecutionEngine::new(
            vec![
                Step::new("a").with_fn(|_, _| async { Err::<Value, _>(anyhow::anyhow!("disk full")) }),
                Step::new("b").depends_on(["a"]),
            ],
            Vec::new(),
            EngineConfig::default(),
        )
        .unwrap()
        .with_sink(sink.clone());

        let report = engine.run(ContextBag::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.step_status("a"), Some(StepStatus::Failed));
        assert_eq!(report.blocked, vec!["b".to_string()]);
        assert_eq!(report.context.error("a").as_deref(), Some("disk full"));
        assert!(sink.events().last().map(|e| e.kind()) == Some("complete"));
    }

    #[tokio::test]
    async fn test_context_cannot_be_reused() {
        let engine =
            ExecutionEngine::new(vec![Step::new("a")], Vec::new(), EngineConfig::default()).unwrap();
        let ctx = Arc::new(engine.new_context(ContextBag::new()));
        engine.run_with_context(ctx.clone()).await.unwrap();
        assert!(matches!(
            engine.run_with_context(ctx).await,
            Err(FlowError::Internal { .. })
        ));
    }
}
