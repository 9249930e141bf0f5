//! Session error types

use thiserror::Error;

/// Errors from the session layer
#[derive(Debug, Error)]
pub enum SessionError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol error
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Malformed packet
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid peer URL
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The session is shutting down
    #[error("session shutdown")]
    Shutdown,
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
