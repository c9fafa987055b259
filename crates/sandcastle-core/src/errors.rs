//! Error types for the execution orchestrator
//!
//! `OrchestratorError` is what callers of the facade see. `RuntimeCallError`
//! classifies the outcome of a single call against the container runtime so
//! the lifecycle layer can decide between retrying, treating the call as an
//! idempotent no-op, or surfacing a failure.

use crate::core_types::ExecutionStatus;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Unsupported runtime: {language}{}", .version.as_ref().map(|v| format!(" {}", v)).unwrap_or_default())]
    UnsupportedRuntime {
        language: String,
        version: Option<String>,
    },
    #[error("Invalid resource request: {0}")]
    InvalidResourceRequest(String),
    #[error("Invalid execution source: {0}")]
    InvalidSource(String),
    #[error("Container creation failed: {0}")]
    ContainerCreateError(String),
    #[error("Container start failed: {0}")]
    ContainerStartError(String),
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),
    #[error("Duplicate execution id: {0}")]
    DuplicateExecution(String),
    #[error("Invalid transition for execution {execution_id}: {from} -> {to}")]
    InvalidTransition {
        execution_id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        OrchestratorError::IoError(err.to_string())
    }
}

/// Outcome classification for one container runtime call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCallError {
    /// Daemon unreachable, busy or the call exceeded its per-call timeout.
    #[error("transient runtime failure: {0}")]
    Transient(String),
    #[error("no such object: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// The container was already in the requested state.
    #[error("not modified")]
    NotModified,
    #[error("rejected by runtime: {0}")]
    Rejected(String),
}

impl RuntimeCallError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeCallError::Transient(_))
    }
}

impl From<bollard::errors::Error> for RuntimeCallError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error as BollardError;
        match err {
            BollardError::DockerResponseServerError {
                status_code,
                message,
            } => match status_code {
                304 => RuntimeCallError::NotModified,
                404 => RuntimeCallError::NotFound(message),
                409 => RuntimeCallError::Conflict(message),
                502..=504 => RuntimeCallError::Transient(message),
                500 if is_transient_server_message(&message) => RuntimeCallError::Transient(message),
                _ => RuntimeCallError::Rejected(format!("HTTP {}: {}", status_code, message)),
            },
            e @ BollardError::RequestTimeoutError => RuntimeCallError::Transient(e.to_string()),
            e @ BollardError::IOError { .. } => RuntimeCallError::Transient(e.to_string()),
            e @ BollardError::HyperResponseError { .. } => {
                RuntimeCallError::Transient(e.to_string())
            }
            e => RuntimeCallError::Rejected(e.to_string()),
        }
    }
}

/// Docker answers 500 both for daemon-side hiccups and for permanent
/// failures such as a bad bind source or an OCI exec error.
fn is_transient_server_message(message: &str) -> bool {
    let message = message.to_lowercase();
    [
        "deadline exceeded",
        "timeout",
        "timed out",
        "connection refused",
        "connection reset",
        "try again",
        "resource temporarily unavailable",
    ]
    .iter()
    .any(|hint| message.contains(hint))
}
