/// Error types for the task-package workflow engine.
use crate::state_machine::LifecycleStatus;
use serde::Serialize;
use thiserror::Error;

/// Coarse error classification shared by every layer.
///
/// The HTTP layer maps these to status codes; operators map them to
/// error-tagged cleanup messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    StateConflict,
    ProviderUnavailable,
    InternalInvariant,
}

/// Core error type for workflow, store and operator operations.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{message}")]
    StateConflict {
        message: String,
        current_status: LifecycleStatus,
    },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: LifecycleStatus,
        to: LifecycleStatus,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Event bus error: {0}")]
    Bus(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Operator configuration error: {0}")]
    Config(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal invariant violated: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::Validation(_) | WorkflowError::Config(_) | WorkflowError::Json(_) => {
                ErrorKind::Validation
            }
            WorkflowError::NotFound(_) => ErrorKind::NotFound,
            WorkflowError::StateConflict { .. } | WorkflowError::InvalidTransition { .. } => {
                ErrorKind::StateConflict
            }
            WorkflowError::Database(_)
            | WorkflowError::Bus(_)
            | WorkflowError::ProviderUnavailable(_) => ErrorKind::ProviderUnavailable,
            WorkflowError::Internal(_) => ErrorKind::InternalInvariant,
        }
    }

    /// Status attached to a state conflict, if any
    pub fn current_status(&self) -> Option<LifecycleStatus> {
        match self {
            WorkflowError::StateConflict { current_status, .. } => Some(*current_status),
            WorkflowError::InvalidTransition { from, .. } => Some(*from),
            _ => None,
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::ProviderUnavailable
    }
}

/// Result type for workflow operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;
