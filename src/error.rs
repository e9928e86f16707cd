//! Error types for the advisory orchestrator

use std::time::Duration;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Model Backend Errors
    // =============================

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend timeout: {0}")]
    BackendTimeout(String),

    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    // =============================
    // Orchestration Errors
    // =============================

    #[error("All specialists failed: {0}")]
    AllSpecialistsFailed(String),

    #[error("Specialist error: {0}")]
    SpecialistError(String),

    #[error("Orchestration aborted: {0}")]
    Aborted(String),

    #[error("Stream session expired: {0}")]
    SessionExpired(String),

    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Single retry policy table keyed by error kind.
    ///
    /// Returns the backoff to wait before the next attempt, or `None` when
    /// the error is non-retryable (or the retry budget is spent). Retries
    /// happen locally inside the component that owns the call; callers
    /// above the component boundary only ever see the final error.
    pub fn retry_after(&self, attempt: u32) -> Option<Duration> {
        match self {
            // Bounded retry with backoff while the backend recovers.
            OrchestrationError::BackendUnavailable(_) if attempt < 1 => {
                Some(Duration::from_millis(250 * (attempt as u64 + 1)))
            }
            // Exactly one retry after a timeout.
            OrchestrationError::BackendTimeout(_) if attempt < 1 => {
                Some(Duration::from_millis(500))
            }
            // SchemaViolation and everything else: non-retryable.
            _ => None,
        }
    }

    /// Machine-readable kind, used in error stream events and trace rows.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestrationError::BackendUnavailable(_) => "backend_unavailable",
            OrchestrationError::BackendTimeout(_) => "backend_timeout",
            OrchestrationError::SchemaViolation(_) => "schema_violation",
            OrchestrationError::AllSpecialistsFailed(_) => "all_specialists_failed",
            OrchestrationError::SpecialistError(_) => "specialist_error",
            OrchestrationError::Aborted(_) => "aborted",
            OrchestrationError::SessionExpired(_) => "session_expired",
            OrchestrationError::AuthorizationDenied(_) => "authorization_denied",
            OrchestrationError::DatabaseError(_) => "database_error",
            OrchestrationError::SerializationError(_) => "serialization_error",
            OrchestrationError::HttpError(_) => "http_error",
            OrchestrationError::UuidError(_) => "uuid_error",
            OrchestrationError::IoError(_) => "io_error",
        }
    }
}
