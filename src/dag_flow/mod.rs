pub mod builtin;
pub mod callbacks;
pub mod context;
pub mod engine;
pub mod events;
pub mod graph;
pub mod manifest;
pub mod registry;
pub mod step;

pub use builtin::{LoggingCallback, ProgressCallback, RetryCallback, SkipWhenCallback, TimingCallback};
pub use callbacks::{Callback, CallbackChain, EdgeScope, HookOutcome, HookResult, StepScope};
pub use context::{ContextBag, ExecutionContext, StepInfo};
pub use engine::{ExecutionEngine, RunReport, RunStream};
pub use events::{
    BufferingEventSink, ChannelEventSink, EventEnvelope, EventSink, LoggingEventSink,
    StatusEmitter, StatusEvent,
};
pub use graph::StepGraph;
pub use manifest::{FlowManifest, StepSpec};
pub use registry::HandlerRegistry;
pub use step::{handler_fn, FnHandler, RunStatus, Step, StepHandler, StepInputs, StepStatus};
