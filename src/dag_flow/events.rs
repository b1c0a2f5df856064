//! Status event protocol
//!
//! Engine transitions become `nodeStatus`, `edgeStatus`, `complete` and
//! `error` events. Event names and payload keys are consumed verbatim by
//! observers (graph views, SSE transports) and must not change.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::step::StepStatus;
use crate::core::errors::{FlowError, Result};

/// Protocol version stamped on every envelope
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatusPayload {
    pub node_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeStatusPayload {
    pub source_id: String,
    pub target_id: String,
    pub status: String,
    pub animated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletePayload {
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub results: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// A single observer-facing notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum StatusEvent {
    #[serde(rename = "nodeStatus")]
    NodeStatus(NodeStatusPayload),
    #[serde(rename = "edgeStatus")]
    EdgeStatus(EdgeStatusPayload),
    #[serde(rename = "complete")]
    Complete(CompletePayload),
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

impl StatusEvent {
    /// Event name on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NodeStatus(_) => "nodeStatus",
            Self::EdgeStatus(_) => "edgeStatus",
            Self::Complete(_) => "complete",
            Self::Error(_) => "error",
        }
    }

    /// `complete` and `error` end the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Error(_))
    }

    pub fn payload(&self) -> Result<Value> {
        let value = match self {
            Self::NodeStatus(p) => serde_json::to_value(p)?,
            Self::EdgeStatus(p) => serde_json::to_value(p)?,
            Self::Complete(p) => serde_json::to_value(p)?,
            Self::Error(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    /// Server-Sent-Events frame: `event: <kind>\ndata: <json>\n\n`
    pub fn to_sse(&self) -> Result<String> {
        // Keys in declaration order
        let data = match self {
            Self::NodeStatus(p) => serde_json::to_string(p)?,
            Self::EdgeStatus(p) => serde_json::to_string(p)?,
            Self::Complete(p) => serde_json::to_string(p)?,
            Self::Error(p) => serde_json::to_string(p)?,
        };
        Ok(format!("event: {}\ndata: {}\n\n", self.kind(), data))
    }

    /// `(nodeId, status)` for node events
    pub fn node_status(&self) -> Option<(&str, &str)> {
        match self {
            Self::NodeStatus(p) => Some((p.node_id.as_str(), p.status.as_str())),
            _ => None,
        }
    }
}

/// Event envelope with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub version: u32,
    pub sequence: u64,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: StatusEvent,
}

/// Event sink trait for delivering events
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &EventEnvelope);
}

/// Sends every event to `tracing` at debug level
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, envelope: &EventEnvelope) {
        debug!(
            run_id = %envelope.run_id,
            sequence = envelope.sequence,
            kind = envelope.event.kind(),
            "Event: {:?}",
            envelope.event
        );
    }
}

/// A buffering event sink that collects events
#[derive(Default)]
pub struct BufferingEventSink {
    events: RwLock<Vec<EventEnvelope>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_events(&self) -> Vec<EventEnvelope> {
        self.events.read().clone()
    }

    /// Just the events, without envelopes
    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.read().iter().map(|e| e.event.clone()).collect()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, envelope: &EventEnvelope) {
        self.events.write().push(envelope.clone());
    }
}

/// Forwards events into a tokio channel, e.g. for an HTTP event stream
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

impl ChannelEventSink {
    pub fn new(tx: mpsc::UnboundedSender<EventEnvelope>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, envelope: &EventEnvelope) {
        // The receiver going away means the observer disconnected
        let _ = self.tx.send(envelope.clone());
    }
}

struct EmitterState {
    sequence: u64,
    terminated: bool,
}

/// Translates engine transitions into validated status events.
///
/// Delivery order equals call order; once a terminal event has gone out
/// everything else is dropped.
pub struct StatusEmitter {
    run_id: String,
    graph_id: Option<String>,
    known_steps: HashSet<String>,
    sinks: Vec<Arc<dyn EventSink>>,
    state: Mutex<EmitterState>,
}

impl StatusEmitter {
    pub fn new<I, S>(
        run_id: impl Into<String>,
        graph_id: Option<String>,
        steps: I,
        sinks: Vec<Arc<dyn EventSink>>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            run_id: run_id.into(),
            graph_id,
            known_steps: steps.into_iter().map(Into::into).collect(),
            sinks,
            state: Mutex::new(EmitterState {
                sequence: 0,
                terminated: false,
            }),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    fn check_step(&self, step_id: &str) -> Result<()> {
        if self.known_steps.contains(step_id) {
            Ok(())
        } else {
            Err(FlowError::invalid_event(format!(
                "event references unknown step '{}'",
                step_id
            )))
        }
    }

    /// Returns false if the stream was already closed
    fn dispatch(&self, event: StatusEvent) -> bool {
        let mut state = self.state.lock();
        if state.terminated {
            debug!(kind = event.kind(), "Dropping event after terminal event");
            return false;
        }
        state.terminated = event.is_terminal();
        let envelope = EventEnvelope {
            version: PROTOCOL_VERSION,
            sequence: state.sequence,
            run_id: self.run_id.clone(),
            timestamp: Utc::now(),
            event,
        };
        state.sequence += 1;
        for sink in &self.sinks {
            sink.emit(&envelope);
        }
        true
    }

    pub fn node_status(
        &self,
        step_id: &str,
        status: StepStatus,
        message: Option<String>,
    ) -> Result<()> {
        self.check_step(step_id)?;
        self.dispatch(StatusEvent::NodeStatus(NodeStatusPayload {
            node_id: step_id.to_string(),
            status: status.wire_name().to_string(),
            graph_id: self.graph_id.clone(),
            message,
        }));
        Ok(())
    }

    /// The edge `from -> to` carries work: `from` succeeded and `to` is starting.
    pub fn edge_active(&self, from: &str, to: &str) -> Result<()> {
        self.edge(from, to, StepStatus::Running, true)
    }

    /// The edge settles as `error` if its target failed, else `success`.
    pub fn edge_settled(&self, from: &str, to: &str, target_status: StepStatus) -> Result<()> {
        let status = match target_status {
            StepStatus::Failed => StepStatus::Failed,
            _ => StepStatus::Succeeded,
        };
        self.edge(from, to, status, false)
    }

    fn edge(&self, from: &str, to: &str, status: StepStatus, animated: bool) -> Result<()> {
        self.check_step(from)?;
        self.check_step(to)?;
        self.dispatch(StatusEvent::EdgeStatus(EdgeStatusPayload {
            source_id: from.to_string(),
            target_id: to.to_string(),
            status: status.wire_name().to_string(),
            animated,
            graph_id: self.graph_id.clone(),
        }));
        Ok(())
    }

    /// Emit `complete`; `Ok(false)` if a terminal event was already sent.
    pub fn complete(&self, results: Map<String, Value>, message: Option<String>) -> Result<bool> {
        if let Some(unknown) = results.keys().find(|k| !self.known_steps.contains(*k)) {
            return Err(FlowError::invalid_event(format!(
                "results contain unknown step '{}'",
                unknown
            )));
        }
        Ok(self.dispatch(StatusEvent::Complete(CompletePayload {
            completed: true,
            message,
            results,
        })))
    }

    /// Emit a terminal `error`; `Ok(false)` if a terminal event was already sent.
    pub fn error(&self, message: impl Into<String>, step_id: Option<&str>) -> Result<bool> {
        let message = message.into();
        if message.trim().is_empty() {
            return Err(FlowError::invalid_event("error message must not be empty"));
        }
        if let Some(id) = step_id {
            self.check_step(id)?;
        }
        Ok(self.dispatch(StatusEvent::Error(ErrorPayload {
            error: true,
            message,
            node_id: step_id.map(str::to_string),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn emitter(sink: Arc<BufferingEventSink>) -> StatusEmitter {
        StatusEmitter::new("run-1", Some("etl".into()), ["a", "b"], vec![sink as Arc<dyn EventSink>])
    }

    #[test]
    fn test_payload_keys_are_preserved() {
        let sink = Arc::new(BufferingEventSink::new());
        let em = emitter(sink.clone());
        em.node_status("a", StepStatus::Running, None).unwrap();
        em.edge_active("a", "b").unwrap();

        let events = sink.events();
        assert_eq!(
            events[0].payload().unwrap(),
            json!({"nodeId": "a", "status": "running", "graphId": "etl"})
        );
        assert_eq!(
            events[1].payload().unwrap(),
            json!({"sourceId": "a", "targetId": "b", "status": "running", "animated": true, "graphId": "etl"})
        );
    }

    #[test]
    fn test_settled_edges_use_edge_statuses() {
        let sink = Arc::new(BufferingEventSink::new());
        let em = emitter(sink.clone());
        em.edge_settled("a", "b", StepStatus::Succeeded).unwrap();
        em.edge_settled("a", "b", StepStatus::Skipped).unwrap();
        em.edge_settled("a", "b", StepStatus::Failed).unwrap();

        let statuses: Vec<Value> = sink
            .events()
            .iter()
            .map(|e| e.payload().unwrap()["status"].clone())
            .collect();
        assert_eq!(statuses, vec![json!("success"), json!("success"), json!("error")]);
    }

    #[test]
    fn test_sse_frame() {
        let event = StatusEvent::Error(ErrorPayload {
            error: true,
            message: "Flow cancelled".into(),
            node_id: None,
        });
        assert_eq!(
            event.to_sse().unwrap(),
            "event: error\ndata: {\"error\":true,\"message\":\"Flow cancelled\"}\n\n"
        );
    }

    #[test]
    fn test_only_one_terminal_event() {
        let sink = Arc::new(BufferingEventSink::new());
        let em = emitter(sink.clone());
        assert!(em.complete(Map::new(), None).unwrap());
        assert!(!em.error("late", None).unwrap());
        em.node_status("a", StepStatus::Succeeded, None).unwrap();

        let envelopes = sink.get_events();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].sequence, 0);
        assert!(em.is_terminated());
    }

    #[test]
    fn test_unknown_ids_are_rejected() {
        let em = emitter(Arc::new(BufferingEventSink::new()));
        assert!(em.node_status("zzz", StepStatus::Running, None).is_err());
        let mut results = Map::new();
        results.insert("zzz".into(), json!(1));
        assert!(matches!(
            em.complete(results, None),
            Err(FlowError::InvalidEvent { .. })
        ));
        assert!(!em.is_terminated());
    }
}
