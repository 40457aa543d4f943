//! Error types for the engine.

use thiserror::Error;

/// Errors surfaced by cluster collaborators.
///
/// The engine never treats these as fatal. Watch setup failures become
/// user-facing error actions, and per-object failures are logged and skipped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The request may succeed if retried.
    #[error("transient error: {0}")]
    Transient(String),

    /// The object does not exist (any more).
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller is not allowed to perform the request.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The underlying connection or stream was closed.
    #[error("connection closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

impl ClientError {
    /// Returns true if the error refers to a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

/// Errors produced inside the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cluster client error: {0}")]
    Client(#[from] ClientError),

    #[error("status sink error: {0}")]
    Status(String),

    #[error("subscriber {name} failed: {message}")]
    Subscriber { name: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_display() {
        let err = ClientError::Forbidden("pods is forbidden".to_string());
        assert_eq!(err.to_string(), "forbidden: pods is forbidden");
        assert!(!err.is_not_found());
        assert!(ClientError::NotFound("pod/web".to_string()).is_not_found());
    }

    #[test]
    fn test_engine_error_from_client() {
        let err: EngineError = ClientError::Closed.into();
        assert_eq!(err.to_string(), "cluster client error: connection closed");
    }
}
