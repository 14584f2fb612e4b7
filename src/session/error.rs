//! Session Error Types

use thiserror::Error;

use crate::credentials::StoreError;
use crate::protocol::ProtocolError;

/// Session layer errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    Validation(String),

    #[error("Session not connected: {0}")]
    NotConnected(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Credential store error: {0}")]
    Store(#[from] StoreError),

    #[error("Session failed to start: {0}")]
    StartFailed(String),

    #[error("Session registry is shutting down")]
    Shutdown,
}

impl From<SessionError> for String {
    fn from(err: SessionError) -> String {
        err.to_string()
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
