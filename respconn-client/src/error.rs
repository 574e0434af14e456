//! Client error types.

use respconn_protocol::ProtocolError;
use std::sync::Arc;
use thiserror::Error;

/// Errors observed by callers as request outcomes.
///
/// `Clone` so a single connection failure can resolve every affected request.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    ConnectFailed(Arc<std::io::Error>),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("write failed after {attempts} attempts: {source}")]
    WriteExhausted {
        attempts: u32,
        source: Arc<std::io::Error>,
    },

    #[error("write not acknowledged within {0:?}")]
    WriteTimeout(std::time::Duration),

    #[error("connection terminated: {0}")]
    ConnectionTerminated(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("abort did not complete within {0:?}")]
    AbortTimeout(std::time::Duration),

    #[error("reply decode failed: {0}")]
    Decode(ProtocolError),

    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    #[error("server error: {0}")]
    Server(String),

    #[error("connection is in subscriber mode")]
    PushMode,

    #[error("connection is not in subscriber mode")]
    NotSubscribed,

    #[error("transaction aborted")]
    TransactionAborted,

    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::ConnectFailed(_) => true,
            ClientError::ConnectTimeout(_) => true,
            ClientError::ConnectionTerminated(_) => true,
            ClientError::ConnectionClosed => true,
            _ => false,
        }
    }

    pub(crate) fn io(kind: fn(Arc<std::io::Error>) -> ClientError, err: std::io::Error) -> Self {
        kind(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    #[test]
    fn test_retryable_classification() {
        let err = ClientError::io(ClientError::ConnectFailed, io::Error::other("boom"));
        assert!(err.is_retryable());
        assert!(ClientError::ConnectTimeout(Duration::from_secs(2)).is_retryable());
        assert!(ClientError::ConnectionClosed.is_retryable());

        assert!(!ClientError::Server("ERR".into()).is_retryable());
        assert!(!ClientError::PushMode.is_retryable());
        let exhausted = ClientError::WriteExhausted {
            attempts: 3,
            source: Arc::new(io::Error::other("boom")),
        };
        assert!(!exhausted.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = ClientError::WriteExhausted {
            attempts: 3,
            source: Arc::new(io::Error::new(io::ErrorKind::BrokenPipe, "pipe")),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("pipe"));

        let err = ClientError::Decode(ProtocolError::InvalidType(b'?'));
        assert!(err.to_string().contains("decode"));
    }

    #[test]
    fn test_error_is_clone() {
        let err = ClientError::io(ClientError::ConnectFailed, io::Error::other("refused"));
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }
}
