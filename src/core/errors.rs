use std::fmt;
use thiserror::Error;

/// Extension point a hook was running at when it produced an error or signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    BeforeRun,
    AfterRun,
    BeforeStep,
    AfterStep,
    OnError,
    OnCancel,
    BeforeEdge,
    AfterEdge,
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BeforeRun => "before_run",
            Self::AfterRun => "after_run",
            Self::BeforeStep => "before_step",
            Self::AfterStep => "after_step",
            Self::OnError => "on_error",
            Self::OnCancel => "on_cancel",
            Self::BeforeEdge => "before_edge",
            Self::AfterEdge => "after_edge",
        };
        f.write_str(name)
    }
}

/// Unified error type for graph construction, configuration and runs
#[derive(Debug, Error)]
pub enum FlowError {
    /// A step id is empty
    #[error("Invalid step id: {message}")]
    InvalidStep { message: String },

    /// Two steps share an id
    #[error("Duplicate step id: {step}")]
    DuplicateStep { step: String },

    /// A dependency names a step that was never declared
    #[error("Unknown dependency '{dependency}' for step '{step}'")]
    UnknownDependency { step: String, dependency: String },

    /// A step lists itself as a dependency
    #[error("Step '{step}' depends on itself")]
    SelfDependency { step: String },

    /// The dependency graph contains a cycle
    #[error("Dependency cycle detected: {rendered}", rendered = .path.join(" -> "))]
    Cycle { path: Vec<String> },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// A hook failed with something other than a control signal
    #[error(
        "Hook '{hook}' faulted in {point}{suffix}: {source}",
        suffix = .step.as_ref().map(|s| format!(" for step '{}'", s)).unwrap_or_default()
    )]
    HookFault {
        hook: String,
        point: HookPoint,
        step: Option<String>,
        #[source]
        source: anyhow::Error,
    },

    /// A hook raised a signal the extension point cannot honour
    #[error("Hook '{hook}' raised {signal} in {point}, which does not accept it")]
    UnsupportedSignal {
        hook: String,
        point: HookPoint,
        signal: String,
    },

    /// An event failed structural validation before serialization
    #[error("Invalid status event: {message}")]
    InvalidEvent { message: String },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl FlowError {
    pub fn invalid_step<S: Into<String>>(message: S) -> Self {
        Self::InvalidStep {
            message: message.into(),
        }
    }

    pub fn duplicate_step<S: Into<String>>(step: S) -> Self {
        Self::DuplicateStep { step: step.into() }
    }

    pub fn unknown_dependency<S: Into<String>, D: Into<String>>(step: S, dependency: D) -> Self {
        Self::UnknownDependency {
            step: step.into(),
            dependency: dependency.into(),
        }
    }

    pub fn self_dependency<S: Into<String>>(step: S) -> Self {
        Self::SelfDependency { step: step.into() }
    }

    pub fn cycle(path: Vec<String>) -> Self {
        Self::Cycle { path }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error pointing at a field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn hook_fault<H: Into<String>>(
        hook: H,
        point: HookPoint,
        step: Option<&str>,
        source: anyhow::Error,
    ) -> Self {
        Self::HookFault {
            hook: hook.into(),
            point,
            step: step.map(str::to_string),
            source,
        }
    }

    pub fn unsupported_signal<H: Into<String>, S: Into<String>>(
        hook: H,
        point: HookPoint,
        signal: S,
    ) -> Self {
        Self::UnsupportedSignal {
            hook: hook.into(),
            point,
            signal: signal.into(),
        }
    }

    pub fn invalid_event<S: Into<String>>(message: S) -> Self {
        Self::InvalidEvent {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for errors raised while validating the step list
    pub fn is_graph_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidStep { .. }
                | Self::DuplicateStep { .. }
                | Self::UnknownDependency { .. }
                | Self::SelfDependency { .. }
                | Self::Cycle { .. }
        )
    }

    /// True for errors raised by user hooks during a run
    pub fn is_hook_fault(&self) -> bool {
        matches!(self, Self::HookFault { .. } | Self::UnsupportedSignal { .. })
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidStep { .. }
            | Self::DuplicateStep { .. }
            | Self::UnknownDependency { .. }
            | Self::SelfDependency { .. }
            | Self::Cycle { .. } => "graph",
            Self::Configuration { .. } => "configuration",
            Self::HookFault { .. } | Self::UnsupportedSignal { .. } => "hook",
            Self::InvalidEvent { .. } => "event",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, FlowError>;

impl From<std::io::Error> for FlowError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for FlowError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}
