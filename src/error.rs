use thiserror::Error;

use crate::strategy::workflow::ExecutionStep;

/// Main error type for the carry coordinator
#[derive(Error, Debug)]
pub enum CarryError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Transient connectivity problem; the stream client retries these forever.
    #[error("Connection error: {0}")]
    Connection(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed {topic} message: {reason}")]
    MessageDecode { topic: String, reason: String },

    // Market / account data errors
    #[error("Data unavailable for {coin}: missing {field}")]
    DataUnavailable { coin: String, field: String },

    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    // Venue errors
    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    // Workflow errors
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    // State errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for CarryError
pub type Result<T> = std::result::Result<T, CarryError>;

/// A single workflow step that failed, with the reason.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("step {step} failed: {cause}")]
pub struct StepFailure {
    pub step: ExecutionStep,
    pub cause: String,
}

impl StepFailure {
    pub fn new(step: ExecutionStep, cause: impl ToString) -> Self {
        Self {
            step,
            cause: cause.to_string(),
        }
    }
}

/// Errors surfaced by the entry workflow.
///
/// `Precondition` means nothing was sent to any venue. `Step` means the very first
/// step failed, so no venue state changed. `PartialExecution` means earlier steps
/// already landed on-chain and must be reconciled by hand; it is never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error(transparent)]
    Step(StepFailure),

    #[error("Partial execution, manual reconciliation required (completed: {completed:?}): {failure}")]
    PartialExecution {
        completed: Vec<ExecutionStep>,
        failure: StepFailure,
    },
}

impl ExecutionError {
    /// The step that failed, if any step ran at all.
    pub fn failed_step(&self) -> Option<ExecutionStep> {
        match self {
            ExecutionError::Precondition(_) => None,
            ExecutionError::Step(failure) => Some(failure.step),
            ExecutionError::PartialExecution { failure, .. } => Some(failure.step),
        }
    }

    /// Whether venue state changed before the failure.
    pub fn has_side_effects(&self) -> bool {
        matches!(self, ExecutionError::PartialExecution { .. })
    }
}
