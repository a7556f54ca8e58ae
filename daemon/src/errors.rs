/// Error types for the control-plane daemon

use hyper::StatusCode;
use serde_json::{json, Value};
use taskpack_core::{ErrorKind, LifecycleStatus, WorkflowError};
use thiserror::Error;

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Daemon error types
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Missing credential
    #[error("{0}")]
    Unauthorized(String),

    /// Credential rejected or definition not allowed
    #[error("{0}")]
    Forbidden(String),

    /// Malformed or incomplete request
    #[error("{0}")]
    InvalidRequest(String),

    /// Unknown definition, instance or route
    #[error("{0}")]
    NotFound(String),

    /// Request conflicts with the instance's lifecycle state
    #[error("{message}")]
    StateConflict {
        message: String,
        current_status: Option<LifecycleStatus>,
    },

    /// Identity provider or store unreachable
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Fan-out did not finish in time
    #[error("Operation timed out")]
    Timeout,

    /// Server error
    #[error("Server error: {0}")]
    ServerError(String),

    /// Metrics error
    #[error("Metrics error: {0}")]
    MetricsError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl DaemonError {
    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            DaemonError::InvalidRequest(_)
            | DaemonError::StateConflict { .. }
            | DaemonError::SerializationError(_) => StatusCode::BAD_REQUEST,
            DaemonError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            DaemonError::Forbidden(_) => StatusCode::FORBIDDEN,
            DaemonError::NotFound(_) => StatusCode::NOT_FOUND,
            DaemonError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DaemonError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            DaemonError::ConfigError(_)
            | DaemonError::ServerError(_)
            | DaemonError::MetricsError(_)
            | DaemonError::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON body accompanying a non-2xx response
    pub fn to_body(&self) -> Value {
        match self {
            DaemonError::StateConflict {
                message,
                current_status: Some(status),
            } => json!({ "error": message, "current_status": status }),
            other => json!({ "error": other.to_string() }),
        }
    }
}

impl From<WorkflowError> for DaemonError {
    fn from(e: WorkflowError) -> Self {
        let current_status = e.current_status();
        match e {
            WorkflowError::NotFound(message) => return DaemonError::NotFound(message),
            WorkflowError::Validation(message) => return DaemonError::InvalidRequest(message),
            _ => {}
        }
        match e.kind() {
            ErrorKind::Validation => DaemonError::InvalidRequest(e.to_string()),
            ErrorKind::NotFound => DaemonError::NotFound(e.to_string()),
            ErrorKind::StateConflict => DaemonError::StateConflict {
                message: e.to_string(),
                current_status,
            },
            ErrorKind::ProviderUnavailable => DaemonError::Unavailable(e.to_string()),
            ErrorKind::InternalInvariant => DaemonError::ServerError(e.to_string()),
        }
    }
}

impl From<serde_json::error::Error> for DaemonError {
    fn from(e: serde_json::error::Error) -> Self {
        DaemonError::SerializationError(e.to_string())
    }
}

impl From<hyper::Error> for DaemonError {
    fn from(e: hyper::Error) -> Self {
        DaemonError::ServerError(e.to_string())
    }
}
