//! Error types for cellrun-core.

use thiserror::Error;

use crate::state::ExecutionState;

/// Result type for cellrun-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in cellrun-core.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The execution unit failed or timed out while starting.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// The execution unit crashed or exited unexpectedly.
    #[error("execution unit crashed: {0}")]
    UnitCrashed(String),

    /// The unit has not completed its init handshake.
    #[error("worker is not ready")]
    NotReady,

    /// An execution is already in flight on this unit.
    #[error("another execution is already running")]
    ExecutionInProgress,

    /// IPC communication error with the execution unit.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Illegal execution state transition.
    #[error("invalid transition from {from} on {event}")]
    InvalidTransition {
        from: ExecutionState,
        event: &'static str,
    },

    /// The host was shut down.
    #[error("execution host has been shut down")]
    Shutdown,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl Error {
    /// Render the error together with a recovery hint, if one applies.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Self::Initialization(_) => Some("check the worker command, or raise init_timeout_ms"),
            Self::UnitCrashed(_) => Some("the unit must be reset before further executions"),
            Self::NotReady => Some("call initialize() and wait for the unit to become ready"),
            Self::ExecutionInProgress => Some("wait for the running execution or interrupt it"),
            Self::Config(_) => Some("see `cellrun check` for the effective configuration"),
            Self::Ipc(msg) if msg.contains("worker binary") => {
                Some("set CELLRUN_WORKER_PATH or build cellrun-worker")
            }
            _ => None,
        };

        match hint {
            Some(hint) => format!("{self}\n  hint: {hint}"),
            None => self.to_string(),
        }
    }
}
