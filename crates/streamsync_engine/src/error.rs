//! Error types for the streaming engine.

use streamsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in the streaming engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server answered with a non-success status.
    #[error("http status {status}: {body}")]
    Http {
        /// Status code.
        status: u16,
        /// Response body text, possibly truncated.
        body: String,
    },

    /// Malformed wire data.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The call was rejected because of missing or conflicting configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The credential provider failed.
    #[error("credential error: {0}")]
    Credentials(String),

    /// The engine has been disposed.
    #[error("engine disposed")]
    Disposed,
}

impl EngineError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Transport { retryable, .. } => *retryable,
            EngineError::Http { status, .. } => *status >= 500 || *status == 401 || *status == 429,
            EngineError::Credentials(_) => true,
            _ => false,
        }
    }

    /// Returns the HTTP status and body if this is a status error.
    pub fn http_status(&self) -> Option<(u16, &str)> {
        match self {
            EngineError::Http { status, body } => Some((*status, body.as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(EngineError::transport_retryable("connection reset").is_retryable());
        assert!(!EngineError::transport_fatal("invalid certificate").is_retryable());
        assert!(EngineError::Http {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!EngineError::Http {
            status: 404,
            body: String::new()
        }
        .is_retryable());
        assert!(!EngineError::Disposed.is_retryable());
        assert!(!EngineError::Config("x".into()).is_retryable());
    }

    #[test]
    fn http_status_accessor() {
        let err = EngineError::Http {
            status: 401,
            body: "token expired".into(),
        };
        assert_eq!(err.http_status(), Some((401, "token expired")));
        assert_eq!(EngineError::Disposed.http_status(), None);
    }

    #[test]
    fn protocol_errors_convert() {
        let err: EngineError = ProtocolError::NotAnObject.into();
        assert!(err.to_string().contains("not a json object"));
    }
}
