//! Session error descriptors.
//!
//! These are the stable, cloneable descriptors stored in the session's
//! `last_error` slot. Backend and storage errors are mapped into them at the
//! store boundary; they hold message strings rather than source errors so
//! snapshots of the session state stay cheap to clone.

use identity_client::IdentityError;
use session_cache::StorageError;
use thiserror::Error;

/// Error descriptor surfaced to session subscribers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Transport failure talking to the backend
    #[error("Network error: {0}")]
    Network(String),

    /// Backend call exceeded the request timeout
    #[error("Request timed out")]
    Timeout,

    /// Invalid email or password
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Backend rejected the payload (e.g. duplicate email on sign-up)
    #[error("Rejected by backend: {0}")]
    Validation(String),

    /// Expected backend resource is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Session was invalidated server-side
    #[error("Session invalid: {0}")]
    SessionInvalid(String),

    /// Local cache read/write failure
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl SessionError {
    /// Stable key for this error, suitable for localization lookup.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Network(_) => "network",
            SessionError::Timeout => "timeout",
            SessionError::InvalidCredentials(_) => "invalid_credentials",
            SessionError::Validation(_) => "validation",
            SessionError::NotFound(_) => "not_found",
            SessionError::SessionInvalid(_) => "session_invalid",
            SessionError::Persistence(_) => "persistence",
        }
    }
}

impl From<IdentityError> for SessionError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::InvalidCredentials(m) => SessionError::InvalidCredentials(m),
            IdentityError::Validation(m) => SessionError::Validation(m),
            IdentityError::NotFound(m) => SessionError::NotFound(m),
            IdentityError::SessionInvalid(m) => SessionError::SessionInvalid(m),
            IdentityError::Timeout => SessionError::Timeout,
            IdentityError::Unavailable(m) => SessionError::Network(m),
            IdentityError::Http(e) => {
                if e.is_timeout() {
                    SessionError::Timeout
                } else {
                    SessionError::Network(e.to_string())
                }
            }
            IdentityError::Protocol(m) => SessionError::Network(m),
            IdentityError::Json(e) => SessionError::Network(e.to_string()),
            IdentityError::InvalidUrl(e) => SessionError::Network(e.to_string()),
        }
    }
}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        SessionError::Persistence(err.to_string())
    }
}

/// Result type alias using SessionError.
pub type SessionResult<T> = Result<T, SessionError>;
