//! Error types for the workflow engine

use thiserror::Error;

/// Result type for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Comprehensive error taxonomy for the workflow engine.
///
/// Variants are grouped by kind (validation, policy, transient I/O,
/// resource, sandbox, user-code, cancellation, configuration) rather than
/// by the type that raised them, per the error handling design.
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Malformed block logic, missing required field, invalid URL
    #[error("Validation error: {0}")]
    Validation(String),

    /// SSRF block or static-analysis denylist hit
    #[error("Policy violation: {0}")]
    Policy(String),

    /// Network timeout, HTTP status mismatch
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Step or time budget exceeded
    #[error("Resource limit exceeded: {0}")]
    Resource(String),

    /// Sandbox wall-clock or vm deadline tripped
    #[error("Sandbox timeout: {0}")]
    SandboxTimeout(String),

    /// Exception thrown by user-supplied code
    #[error("User code error: {0}")]
    UserCode(String),

    /// Cooperative cancellation of a run
    #[error("cancelled")]
    Cancelled,

    /// Missing handler for a block type, or other setup defect
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Block, run, or step not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid state transition (e.g. resuming a run that isn't awaiting_action)
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Persistence layer failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Catch-all for unexpected internal failures
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        WorkflowError::Internal(format!("serialization error: {err}"))
    }
}

impl From<std::io::Error> for WorkflowError {
    fn from(err: std::io::Error) -> Self {
        WorkflowError::Persistence(err.to_string())
    }
}

impl From<sled::Error> for WorkflowError {
    fn from(err: sled::Error) -> Self {
        WorkflowError::Persistence(err.to_string())
    }
}

impl From<reqwest::Error> for WorkflowError {
    fn from(err: reqwest::Error) -> Self {
        WorkflowError::TransientIo(err.to_string())
    }
}

/// A single step's recorded failure, surfaced to later blocks via `$error`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StepError {
    pub message: String,
    pub stack: Option<String>,
    pub block_id: String,
    pub block_name: String,
}

impl StepError {
    pub fn new(message: impl Into<String>, block_id: impl Into<String>, block_name: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            block_id: block_id.into(),
            block_name: block_name.into(),
        }
    }
}
