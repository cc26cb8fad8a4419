//! Common error types for blocksync.
//!
//! Remote failures are classified the same way everywhere: network and
//! server errors are transient, everything else is permanent until the
//! user changes something.

use thiserror::Error;

/// Top-level error type for blocksync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No API key is configured; the engine is in offline mode.
    #[error("No API key configured")]
    NoCredential,

    /// Connection failure or timeout before a response arrived.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote answered with a 5xx status.
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Remote rejected the credential (401).
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Remote answered with a 4xx status other than 401, 404 and 409.
    #[error("Request rejected ({status}): {message}")]
    Client { status: u16, message: String },

    /// Resource not found (404).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists (409).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Key-value store failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Background scheduler is gone or answered out of turn.
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl Error {
    /// Build an error from a non-success HTTP status and the message the
    /// remote returned with it.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => Error::Authentication(message),
            404 => Error::NotFound(message),
            409 => Error::Conflict(message),
            500..=599 => Error::Server { status, message },
            _ => Error::Client { status, message },
        }
    }

    /// HTTP status carried by this error, if it came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Authentication(_) => Some(401),
            Error::NotFound(_) => Some(404),
            Error::Conflict(_) => Some(409),
            Error::Server { status, .. } | Error::Client { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Authentication(_))
    }

    pub fn is_server(&self) -> bool {
        matches!(self, Error::Server { .. })
    }

    /// Transient failures worth retrying later.
    pub fn is_retryable(&self) -> bool {
        self.is_network() || self.is_server()
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(Error::from_status(401, "bad key").is_auth());
        assert!(matches!(Error::from_status(404, "gone"), Error::NotFound(_)));
        assert!(matches!(Error::from_status(409, "dup"), Error::Conflict(_)));
        assert!(Error::from_status(503, "down").is_server());
        assert!(matches!(
            Error::from_status(422, "bad name"),
            Error::Client { status: 422, .. }
        ));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("timeout".to_string()).is_retryable());
        assert!(Error::from_status(500, "boom").is_retryable());
        assert!(!Error::from_status(401, "nope").is_retryable());
        assert!(!Error::from_status(400, "nope").is_retryable());
        assert!(!Error::NoCredential.is_retryable());
    }

    #[test]
    fn test_status_round_trips() {
        for status in [401u16, 404, 409, 418, 502] {
            assert_eq!(Error::from_status(status, "x").status(), Some(status));
        }
        assert_eq!(Error::Network("x".to_string()).status(), None);
    }
}
