//! Shared state for a single run
//!
//! The context has three sections: the read-only step list, a ledger of
//! results/errors/progress behind one mutex, and a concurrent context bag
//! that handlers and hooks may mutate freely.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::step::{RunStatus, StepStatus};
use crate::core::errors::{FlowError, Result};

/// Free-form key/value data shared by every handler and hook of a run.
///
/// Cloning is cheap; clones share the same storage.
#[derive(Clone, Default)]
pub struct ContextBag {
    values: Arc<DashMap<String, Value>>,
    services: Arc<DashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl ContextBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a bag from a JSON object; other values are rejected.
    pub fn from_json(seed: Value) -> Result<Self> {
        let bag = Self::new();
        match seed {
            Value::Object(map) => {
                for (k, v) in map {
                    bag.values.insert(k, v);
                }
            }
            Value::Null => {}
            other => {
                return Err(FlowError::configuration(format!(
                    "context seed must be a JSON object, got {}",
                    other
                )))
            }
        }
        Ok(bag)
    }

    pub fn insert_value(&self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Serialize and store a value
    pub fn insert<T: Serialize>(&self, key: impl Into<String>, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.values.insert(key.into(), value);
        Ok(())
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|v| v.value().clone())
    }

    /// Fetch and deserialize a value; `Ok(None)` if the key is absent
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.values.get(key) {
            Some(v) => Ok(Some(serde_json::from_value(v.value().clone())?)),
            None => Ok(None),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.remove(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Copy of the serializable entries
    pub fn snapshot(&self) -> Map<String, Value> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Store a non-serializable service such as a connection handle
    pub fn set_service<T: Any + Send + Sync>(&self, name: impl Into<String>, service: Arc<T>) {
        self.services.insert(name.into(), service);
    }

    pub fn service<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.services
            .get(name)
            .and_then(|s| s.value().clone().downcast::<T>().ok())
    }
}

impl std::fmt::Debug for ContextBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBag")
            .field("values", &self.snapshot())
            .field("services", &self.services.len())
            .finish()
    }
}

/// Identifier and dependencies of a step, as seen by hooks
#[derive(Debug, Clone)]
pub struct StepInfo {
    pub id: String,
    pub depends_on: Vec<String>,
}

#[derive(Debug)]
struct Ledger {
    status: RunStatus,
    results: Map<String, Value>,
    errors: HashMap<String, String>,
    step_status: HashMap<String, StepStatus>,
    step_times: HashMap<String, Duration>,
    attempts: HashMap<String, u32>,
    current_step: Option<String>,
    settled: usize,
    cancel_reason: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

/// The single mutable state object of a run.
pub struct ExecutionContext {
    pub run_id: String,
    pub graph_id: Option<String>,
    steps: Vec<StepInfo>,
    bag: ContextBag,
    ledger: Mutex<Ledger>,
    cancelled: AtomicBool,
    started_at: DateTime<Utc>,
    clock: Instant,
}

impl ExecutionContext {
    pub fn new(graph_id: Option<String>, steps: Vec<StepInfo>, bag: ContextBag) -> Self {
        let step_status = steps
            .iter()
            .map(|s| (s.id.clone(), StepStatus::Pending))
            .collect();
        Self {
            run_id: Uuid::new_v4().to_string(),
            graph_id,
            steps,
            bag,
            ledger: Mutex::new(Ledger {
                status: RunStatus::Idle,
                results: Map::new(),
                errors: HashMap::new(),
                step_status,
                step_times: HashMap::new(),
                attempts: HashMap::new(),
                current_step: None,
                settled: 0,
                cancel_reason: None,
                finished_at: None,
            }),
            cancelled: AtomicBool::new(false),
            started_at: Utc::now(),
            clock: Instant::now(),
        }
    }

    pub fn steps(&self) -> &[StepInfo] {
        &self.steps
    }

    pub fn has_step(&self, step_id: &str) -> bool {
        self.steps.iter().any(|s| s.id == step_id)
    }

    pub fn bag(&self) -> &ContextBag {
        &self.bag
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.ledger.lock().finished_at
    }

    /// Time since the context was created
    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    // --- cancellation -------------------------------------------------

    /// Request cancellation. Returns true if this call set the flag.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let first = !self.cancelled.swap(true, Ordering::SeqCst);
        if first {
            self.ledger.lock().cancel_reason = Some(reason.into());
        }
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.ledger.lock().cancel_reason.clone()
    }

    // --- results and errors -------------------------------------------

    pub fn result(&self, step_id: &str) -> Option<Value> {
        self.ledger.lock().results.get(step_id).cloned()
    }

    /// Record or overwrite a step's result
    pub fn set_result(&self, step_id: &str, value: Value) -> Result<()> {
        if !self.has_step(step_id) {
            return Err(FlowError::invalid_step(format!(
                "cannot set result for unknown step '{}'",
                step_id
            )));
        }
        self.ledger.lock().results.insert(step_id.to_string(), value);
        Ok(())
    }

    pub fn remove_result(&self, step_id: &str) -> Option<Value> {
        self.ledger.lock().results.remove(step_id)
    }

    pub fn results(&self) -> Map<String, Value> {
        self.ledger.lock().results.clone()
    }

    pub fn error(&self, step_id: &str) -> Option<String> {
        self.ledger.lock().errors.get(step_id).cloned()
    }

    pub fn record_error(&self, step_id: &str, message: impl Into<String>) {
        self.ledger
            .lock()
            .errors
            .insert(step_id.to_string(), message.into());
    }

    pub fn clear_error(&self, step_id: &str) -> Option<String> {
        self.ledger.lock().errors.remove(step_id)
    }

    pub fn errors(&self) -> HashMap<String, String> {
        self.ledger.lock().errors.clone()
    }

    pub fn has_errors(&self) -> bool {
        !self.ledger.lock().errors.is_empty()
    }

    // --- step bookkeeping ----------------------------------------------

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.ledger.lock().step_status.get(step_id).copied()
    }

    pub fn step_statuses(&self) -> HashMap<String, StepStatus> {
        self.ledger.lock().step_status.clone()
    }

    /// Move a step to `status`. Counts toward progress when the step first
    /// becomes terminal while the run is still live.
    pub(crate) fn set_step_status(&self, step_id: &str, status: StepStatus) {
        let cancelled = self.is_cancelled();
        let mut ledger = self.ledger.lock();
        let previous = ledger.step_status.insert(step_id.to_string(), status);
        let was_terminal = previous.map(|s| s.is_terminal()).unwrap_or(false);
        if status.is_terminal() && !was_terminal && !cancelled {
            ledger.settled += 1;
        }
        if status == StepStatus::Running {
            ledger.current_step = Some(step_id.to_string());
        }
    }

    /// The step most recently moved to running
    pub fn current_step(&self) -> Option<String> {
        self.ledger.lock().current_step.clone()
    }

    pub fn step_time(&self, step_id: &str) -> Option<Duration> {
        self.ledger.lock().step_times.get(step_id).copied()
    }

    pub fn step_times(&self) -> HashMap<String, Duration> {
        self.ledger.lock().step_times.clone()
    }

    pub(crate) fn record_step_time(&self, step_id: &str, elapsed: Duration) {
        self.ledger
            .lock()
            .step_times
            .insert(step_id.to_string(), elapsed);
    }

    pub fn attempts(&self, step_id: &str) -> u32 {
        self.ledger
            .lock()
            .attempts
            .get(step_id)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn next_attempt(&self, step_id: &str) -> u32 {
        let mut ledger = self.ledger.lock();
        let counter = ledger.attempts.entry(step_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub(crate) fn all_attempts(&self) -> HashMap<String, u32> {
        self.ledger.lock().attempts.clone()
    }

    /// Fraction of steps settled before any cancellation, in [0, 1]
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 1.0;
        }
        let settled = self.ledger.lock().settled;
        (settled as f64 / self.steps.len() as f64).min(1.0)
    }

    // --- run status ------------------------------------------------------

    pub fn status(&self) -> RunStatus {
        self.ledger.lock().status
    }

    pub(crate) fn set_status(&self, status: RunStatus) {
        let mut ledger = self.ledger.lock();
        ledger.status = status;
        if status.is_terminal() {
            ledger.finished_at = Some(Utc::now());
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("graph_id", &self.graph_id)
            .field("steps", &self.steps.len())
            .field("cancelled", &self.is_cancelled())
            .field("ledger", &*self.ledger.lock())
            .finish()
    }
}
