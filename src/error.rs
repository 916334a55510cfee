use thiserror::Error;

/// Errors raised by the throttling subsystem.
///
/// Exceeding a quota is not an error; it is reported as a denied
/// [`RateLimitResult`](crate::store::RateLimitResult).
#[derive(Debug, Error)]
pub enum ThrottlerError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Invalid path pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ThrottlerResult<T> = Result<T, ThrottlerError>;
