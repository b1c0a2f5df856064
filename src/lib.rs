//! dagrun - run a DAG of steps with two-way hooks and live status events.
//!
//! ```no_run
//! use dagrun::{ContextBag, EngineConfig, ExecutionEngine, Step};
//! use serde_json::json;
//!
//! # async fn demo() -> dagrun::Result<()> {
//! let engine = ExecutionEngine::new(
//!     vec![
//!         Step::new("fetch").with_fn(|_, _| async { Ok(json!(3)) }),
//!         Step::new("report").depends_on(["fetch"]),
//!     ],
//!     Vec::new(),
//!     EngineConfig::default(),
//! )?;
//! let report = engine.run(ContextBag::new()).await?;
//! assert!(report.is_completed());
//! # Ok(())
//! # }
//! ```

// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
}

pub mod dag_flow;

// Re-exports for convenience
pub use crate::core::config::{EngineConfig, SkipPolicy};
pub use crate::core::errors::{FlowError, HookPoint, Result};
pub use dag_flow::*;
