//! Protocol Error Types
//!
//! Errors raised by the messaging-network connection layer.

use thiserror::Error;

/// Errors from connecting, sending or logging out over a protocol connection
#[derive(Error, Debug)]
pub enum ProtocolError {
    // Connection errors
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection not open")]
    NotConnected,

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    // Operation errors
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Logout failed: {0}")]
    LogoutFailed(String),

    #[error("Request rejected by bridge: {0}")]
    Rejected(String),

    // Bridge plumbing
    #[error("Bridge process error: {0}")]
    Bridge(String),

    #[error("Malformed bridge message: {0}")]
    MalformedMessage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::MalformedMessage(err.to_string())
    }
}

/// Result type alias for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
