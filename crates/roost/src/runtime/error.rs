//! Container runtime error types.

use std::io;

use thiserror::Error;

/// Result type for runtime API calls.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors returned by the container runtime client.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The requested container, network or image does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The runtime answered with a non-success status.
    #[error("runtime {operation} failed ({status}): {message}")]
    Api {
        operation: &'static str,
        status: u16,
        message: String,
    },

    /// The request never reached the runtime or the connection broke.
    #[error("runtime transport error: {0}")]
    Transport(String),

    /// Failed to build a request.
    #[error("invalid runtime request: {0}")]
    Request(#[from] hyper::http::Error),

    /// A response body could not be decoded.
    #[error("failed to decode runtime response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }

    /// Whether this error just means the stream was closed underneath us,
    /// which is expected while a container shuts down.
    pub fn is_end_of_stream(&self) -> bool {
        match self {
            RuntimeError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            RuntimeError::Decode(err) => err.is_eof(),
            _ => false,
        }
    }
}
