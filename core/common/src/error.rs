//! Common error types for fieldsync.

use thiserror::Error;

/// Top-level error type for fieldsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Network transport failed or the remote answered with a non-conflict error.
    #[error("Network error: {0}")]
    Network(String),

    /// An adapter call did not complete within its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Local persistent storage failed.
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

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation is not valid for the item's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Conflict detected.
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl Error {
    /// Whether the failure is transient and worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_) | Error::Io(_))
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
    fn test_retryable_classification() {
        assert!(Error::Network("connection reset".into()).is_retryable());
        assert!(Error::Timeout("push".into()).is_retryable());
        assert!(!Error::Storage("disk full".into()).is_retryable());
        assert!(!Error::Conflict("zona/z1".into()).is_retryable());
    }

    #[test]
    fn test_json_error_conversion() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
