//! Error types for jotter.

use thiserror::Error;
use uuid::Uuid;

use crate::models::{RateLimitDecision, RequestStatus};

/// Result type alias using jotter's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for jotter operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request not found
    #[error("Request not found: {0}")]
    RequestNotFound(Uuid),

    /// A queued job points at a request that does not exist.
    ///
    /// Persistence and queue are out of sync; never retried.
    #[error("Missing request record for job: {0}")]
    MissingRequestRecord(Uuid),

    /// Request status change not allowed by the state machine
    #[error("Invalid request transition: {from} -> {to}")]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },

    /// Admission denied by the rate limiter
    #[error("Rate limit exceeded, retry after {}s", .0.retry_after_secs)]
    RateLimited(RateLimitDecision),

    /// Rate limit counter store unreachable and fail-open disabled
    #[error("Counter store unavailable: {0}")]
    CounterStoreUnavailable(String),

    /// The processing collaborator failed
    #[error("Processing error: {0}")]
    Processing(String),

    /// Job queue error
    #[error("Job error: {0}")]
    Job(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Authentication failed
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Forbidden (authenticated but not authorized)
    #[error("Forbidden: {0}")]
    Forbidden(String),
}

impl Error {
    /// Whether the queue may run the job again after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::MissingRequestRecord(_)
                | Error::InvalidTransition { .. }
                | Error::InvalidInput(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
