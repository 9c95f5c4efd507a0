//! Error handling system

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::core::PluginState;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Plugin already registered: {0}")]
    DuplicateName(String),

    #[error("Missing dependency for '{plugin}': '{dependency}'")]
    MissingDependency { plugin: String, dependency: String },

    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Plugin '{name}' is still required by: {}", .dependents.join(", "))]
    DependencyInUse { name: String, dependents: Vec<String> },

    #[error("Invalid state transition for plugin '{plugin}': {from} -> {to}")]
    InvalidStateTransition {
        plugin: String,
        from: PluginState,
        to: PluginState,
    },

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Plugin '{plugin}' failed during {phase}: {source}")]
    PluginSetup {
        plugin: String,
        phase: &'static str,
        #[source]
        source: Box<CoreError>,
    },

    #[error("Plugin '{plugin}' {phase} timed out after {timeout:?}")]
    Timeout {
        plugin: String,
        phase: &'static str,
        timeout: Duration,
    },

    #[error("Initialization failed for {} plugin(s): {}", .0.len(), join_faults(.0))]
    InitializationFailed(Vec<PluginFault>),

    #[error("Shutdown completed with {} fault(s): {}", .0.len(), join_faults(.0))]
    ShutdownFailed(Vec<PluginFault>),

    #[error("No implementation registered for required hook '{0}'")]
    NoHookImplementation(String),

    #[error("Hook '{hook}' is not implemented by plugin '{plugin}'")]
    HookNotImplemented { plugin: String, hook: String },

    #[error("Panicked: {0}")]
    Panic(String),

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Event processing failed: {0}")]
    EventError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("{0}")]
    Other(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),

    #[error("IO error: {0}")]
    IoError(String),
}

impl CoreError {
    /// Stable name of the error class, used as `error_type` in ERROR events.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::DuplicateName(_) => "DuplicateNameError",
            CoreError::MissingDependency { .. } => "MissingDependencyError",
            CoreError::CyclicDependency { .. } => "CyclicDependencyError",
            CoreError::DependencyInUse { .. } => "DependencyInUseError",
            CoreError::InvalidStateTransition { .. } => "InvalidStateTransitionError",
            CoreError::PluginNotFound(_) => "PluginNotFoundError",
            CoreError::PluginSetup { .. } => "PluginSetupError",
            CoreError::Timeout { .. } => "TimeoutError",
            CoreError::InitializationFailed(_) => "InitializationError",
            CoreError::ShutdownFailed(_) => "ShutdownError",
            CoreError::NoHookImplementation(_) => "NoHookImplementationError",
            CoreError::HookNotImplemented { .. } => "HookNotImplementedError",
            CoreError::Panic(_) => "Panic",
            CoreError::UnknownEventType(_) => "UnknownEventTypeError",
            CoreError::EventError(_) => "EventError",
            CoreError::ConfigError(_) => "ConfigError",
            CoreError::RuntimeError(_) => "RuntimeError",
            CoreError::Other(_) => "Error",
            CoreError::Serialization(_) => "SerializationError",
            CoreError::Internal(_) => "InternalError",
            CoreError::IoError(_) => "IoError",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// A failure attributed to one plugin, collected rather than raised.
#[derive(Debug)]
pub struct PluginFault {
    pub plugin: String,
    pub phase: &'static str,
    pub error: CoreError,
}

impl fmt::Display for PluginFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.plugin, self.phase, self.error)
    }
}

fn join_faults(faults: &[PluginFault]) -> String {
    faults
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<std::io::Error> for CoreError {
    fn from(error: std::io::Error) -> Self {
        CoreError::IoError(error.to_string())
    }
}

#[macro_export]
macro_rules! bail {
    ($msg:literal) => {
        return Err($crate::error::CoreError::Other($msg.to_string()))
    };
    ($err:expr) => {
        return Err($crate::error::CoreError::Other($err.to_string()))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::error::CoreError::Other(format!($fmt, $($arg)*)))
    };
}
