//! Identity backend error types.

use thiserror::Error;

/// Error type for identity backend operations.
#[derive(Error, Debug)]
pub enum IdentityError {
    /// Invalid email or password
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Backend rejected the payload (e.g. duplicate email on sign-up)
    #[error("Rejected by backend: {0}")]
    Validation(String),

    /// Requested resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Session was invalidated server-side (revoked, logged out elsewhere, etc.)
    #[error("Session invalid: {0}")]
    SessionInvalid(String),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Backend unavailable (5xx; transient, can retry)
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Response did not match the expected shape
    #[error("Malformed backend payload: {0}")]
    Protocol(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parse error
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl IdentityError {
    /// Returns true if this error is transient and the operation can be retried.
    ///
    /// Transient errors include:
    /// - Backend unavailable (5xx)
    /// - Connection failures and timeouts
    pub fn is_transient(&self) -> bool {
        match self {
            IdentityError::Timeout => true,
            IdentityError::Unavailable(_) => true,
            IdentityError::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    return true;
                }
                if let Some(status) = e.status() {
                    return status.is_server_error();
                }
                false
            }
            _ => false,
        }
    }
}

/// Result type alias using IdentityError.
pub type IdentityResult<T> = Result<T, IdentityError>;
