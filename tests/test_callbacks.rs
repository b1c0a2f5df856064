use async_trait::async_trait;
use dagrun::dag_flow::builtin::{PROGRESS_PERCENT_KEY, TOTAL_EXECUTION_TIME_KEY};
use dagrun::{
    Callback, ContextBag, EdgeScope, EngineConfig, ExecutionContext, ExecutionEngine, FlowError,
    HookOutcome, HookPoint, HookResult, LoggingCallback, ProgressCallback, RetryCallback,
    SkipWhenCallback, Step, StepScope, StepStatus, TimingCallback,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Appends its name to the bag's `trail` list before every step
struct Trail {
    name: &'static str,
    order: i32,
}

#[async_trait]
impl Callback for Trail {
    fn name(&self) -> &str {
        self.name
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn before_step(&self, ctx: &ExecutionContext, _step: &StepScope) -> HookResult {
        let mut trail: Vec<String> = ctx.bag().get("trail")?.unwrap_or_default();
        trail.push(self.name.to_string());
        ctx.bag().insert("trail", &trail)?;
        Ok(HookOutcome::Continue)
    }
}

/// Captures every scope it is handed
#[derive(Default)]
struct ScopeRecorder {
    scopes: Mutex<Vec<(String, u32, Vec<String>)>>,
}

#[async_trait]
impl Callback for ScopeRecorder {
    fn name(&self) -> &str {
        "scopes"
    }

    async fn after_step(&self, _ctx: &ExecutionContext, step: &StepScope) -> HookResult {
        self.scopes
            .lock()
            .push((step.step_id.clone(), step.attempt, step.depends_on.clone()));
        Ok(HookOutcome::Continue)
    }
}

/// Records each edge hook with the target's status at that moment
#[derive(Default)]
struct EdgeRecorder {
    seen: Mutex<Vec<String>>,
}

impl EdgeRecorder {
    fn record(&self, ctx: &ExecutionContext, hook: &str, edge: &EdgeScope) {
        let status = ctx
            .step_status(&edge.target)
            .map(|s| s.to_string())
            .unwrap_or_default();
        self.seen
            .lock()
            .push(format!("{hook} {}->{} ({status})", edge.source, edge.target));
    }
}

#[async_trait]
impl Callback for EdgeRecorder {
    fn name(&self) -> &str {
        "edges"
    }

    async fn before_edge(&self, ctx: &ExecutionContext, edge: &EdgeScope) -> HookResult {
        self.record(ctx, "before", edge);
        Ok(HookOutcome::Continue)
    }

    async fn after_edge(&self, ctx: &ExecutionContext, edge: &EdgeScope) -> HookResult {
        self.record(ctx, "after", edge);
        Ok(HookOutcome::Continue)
    }
}

/// Tries to skip from an edge hook
struct EdgeSkipper;

#[async_trait]
impl Callback for EdgeSkipper {
    fn name(&self) -> &str {
        "edge-skipper"
    }

    async fn before_edge(&self, _ctx: &ExecutionContext, _edge: &EdgeScope) -> HookResult {
        Ok(HookOutcome::skip("not here"))
    }
}

fn flaky(id: &str, failures: u32, message: &'static str) -> (Step, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let step = Step::new(id).with_fn(move |_, _| {
        let counter = counter.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                Err(anyhow::anyhow!(message))
            } else {
                Ok(json!(n))
            }
        }
    });
    (step, calls)
}

#[tokio::test]
async fn test_hooks_run_in_order_and_share_mutations() {
    let engine = ExecutionEngine::new(
        vec![Step::new("only")],
        vec![
            Arc::new(Trail { name: "third", order: 30 }) as Arc<dyn Callback>,
            Arc::new(Trail { name: "first", order: -5 }),
            Arc::new(Trail { name: "second", order: 0 }),
            Arc::new(Trail { name: "second-b", order: 0 }),
        ],
        EngineConfig::default(),
    )
    .unwrap();

    assert_eq!(
        engine.chain().names(),
        vec!["first", "second", "second-b", "third"]
    );
    let report = engine.run(ContextBag::new()).await.unwrap();
    assert_eq!(
        report.context.bag().get_value("trail"),
        Some(json!(["first", "second", "second-b", "third"]))
    );
}

#[tokio::test]
async fn test_step_scope_carries_attempt_and_dependencies() {
    let recorder = Arc::new(ScopeRecorder::default());
    let (step, _) = flaky("b", 1, "first try fails");
    let engine = ExecutionEngine::new(
        vec![Step::new("a"), step.depends_on(["a"])],
        vec![
            recorder.clone() as Arc<dyn Callback>,
            Arc::new(RetryCallback::new(1)),
        ],
        EngineConfig::default(),
    )
    .unwrap();

    engine.run(ContextBag::new()).await.unwrap();

    assert_eq!(
        *recorder.scopes.lock(),
        vec![
            ("a".to_string(), 1, Vec::<String>::new()),
            ("b".to_string(), 2, vec!["a".to_string()]),
        ]
    );
}

#[tokio::test]
async fn test_retry_predicate_limits_what_is_retried() {
    let (transient, transient_calls) = flaky("transient", 1, "connection reset");
    let (fatal, fatal_calls) = flaky("fatal", 1, "schema mismatch");
    let retry = RetryCallback::new(3).retry_if(|_, err| err.to_string().contains("connection"));
    let engine = ExecutionEngine::new(
        vec![transient, fatal],
        vec![Arc::new(retry)],
        EngineConfig::default(),
    )
    .unwrap();

    let report = engine.run(ContextBag::new()).await.unwrap();

    assert_eq!(transient_calls.load(Ordering::SeqCst), 2);
    assert_eq!(fatal_calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.step_status("transient"), Some(StepStatus::Succeeded));
    assert_eq!(report.step_status("fatal"), Some(StepStatus::Failed));
}

#[tokio::test]
async fn test_retry_budget_resets_between_runs() {
    let (step, calls) = flaky("a", 100, "down");
    let retry = Arc::new(RetryCallback::new(2));
    let engine = ExecutionEngine::new(
        vec![step],
        vec![retry.clone() as Arc<dyn Callback>],
        EngineConfig::default(),
    )
    .unwrap();

    let first = engine.run(ContextBag::new()).await.unwrap();
    let second = engine.run(ContextBag::new()).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(retry.retries_for(&second.context.run_id, "a"), 2);
    // the first run's counters are dropped once the second one starts
    assert_eq!(retry.retries_for(&first.context.run_id, "a"), 0);
}

#[tokio::test]
async fn test_progress_and_timing_callbacks() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let progress = ProgressCallback::new().on_progress(move |pct, id| {
        sink.lock().push((pct.round() as u32, id.to_string()));
    });
    let engine = ExecutionEngine::new(
        vec![
            Step::new("a"),
            Step::new("b").depends_on(["a"]),
            Step::new("c").depends_on(["b"]),
            Step::new("d").depends_on(["c"]),
        ],
        vec![
            Arc::new(progress) as Arc<dyn Callback>,
            Arc::new(TimingCallback::new()),
            Arc::new(LoggingCallback::new()),
        ],
        EngineConfig::default(),
    )
    .unwrap();
    assert_eq!(engine.chain().names(), vec!["timing", "logging", "progress"]);

    let report = engine.run(ContextBag::new()).await.unwrap();

    assert_eq!(
        *seen.lock(),
        vec![
            (25, "a".to_string()),
            (50, "b".to_string()),
            (75, "c".to_string()),
            (100, "d".to_string()),
        ]
    );
    let bag = report.context.bag();
    assert_eq!(bag.get::<f64>(PROGRESS_PERCENT_KEY).unwrap(), Some(100.0));
    assert!(matches!(bag.get_value(TOTAL_EXECUTION_TIME_KEY), Some(Value::Number(_))));
    assert_eq!(report.context.progress(), 1.0);
    assert!(report.context.step_time("d").is_some());
}

#[tokio::test]
async fn test_edge_hooks_wrap_traversed_edges() {
    let recorder = Arc::new(EdgeRecorder::default());
    let engine = ExecutionEngine::new(
        vec![
            Step::new("a"),
            Step::new("b").depends_on(["a"]),
            Step::new("c").depends_on(["b"]),
            Step::new("d").depends_on(["a"]),
        ],
        vec![
            recorder.clone() as Arc<dyn Callback>,
            Arc::new(SkipWhenCallback::steps("skip-d", ["d"])),
        ],
        EngineConfig::default().with_max_concurrency(1),
    )
    .unwrap();

    engine.run(ContextBag::new()).await.unwrap();

    // d is skipped before it starts, so a -> d is never traversed
    assert_eq!(
        *recorder.seen.lock(),
        vec![
            "before a->b (pending)",
            "after a->b (success)",
            "before b->c (pending)",
            "after b->c (success)",
        ]
    );
}

#[tokio::test]
async fn test_edge_hooks_only_continue() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let engine = ExecutionEngine::new(
        vec![
            Step::new("a"),
            Step::new("b").depends_on(["a"]).with_fn(move |_, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            }),
        ],
        vec![Arc::new(EdgeSkipper)],
        EngineConfig::default(),
    )
    .unwrap();

    let err = engine.run(ContextBag::new()).await.unwrap_err();

    assert!(matches!(
        err,
        FlowError::UnsupportedSignal { point: HookPoint::BeforeEdge, .. }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

/// Asks for one re-run of every step, after progress has seen it
#[derive(Default)]
struct RerunOnce {
    rerun: Mutex<Vec<String>>,
}

#[async_trait]
impl Callback for RerunOnce {
    fn name(&self) -> &str {
        "rerun-once"
    }

    fn order(&self) -> i32 {
        95
    }

    async fn after_step(&self, _ctx: &ExecutionContext, step: &StepScope) -> HookResult {
        let mut rerun = self.rerun.lock();
        if rerun.contains(&step.step_id) {
            return Ok(HookOutcome::Continue);
        }
        rerun.push(step.step_id.clone());
        Ok(HookOutcome::retry("once more"))
    }
}

#[tokio::test]
async fn test_progress_ignores_reruns() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let progress = ProgressCallback::new().on_progress(move |pct, _| {
        sink.lock().push(pct.round() as u32);
    });
    let engine = ExecutionEngine::new(
        vec![Step::new("a"), Step::new("b").depends_on(["a"])],
        vec![
            Arc::new(progress) as Arc<dyn Callback>,
            Arc::new(RerunOnce::default()),
        ],
        EngineConfig::default(),
    )
    .unwrap();

    let report = engine.run(ContextBag::new()).await.unwrap();

    assert_eq!(report.attempts("a"), 2);
    assert_eq!(*seen.lock(), vec![50, 50, 100, 100]);
    assert_eq!(
        report.context.bag().get::<f64>(PROGRESS_PERCENT_KEY).unwrap(),
        Some(100.0)
    );
}
