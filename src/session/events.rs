//! Session Events
//!
//! Lifecycle notifications published by the registry.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::state::SessionStatus;

/// Why a session reached the terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TerminationCause {
    /// Caller asked to disconnect
    Logout,
    /// Network reported the device as unlinked
    LoggedOut,
    /// Reconnection attempts exhausted
    GaveUp,
    /// Removed from the registry directly
    Removed,
}

/// Events that can be emitted for a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// Session status changed
    StatusChanged {
        session_id: String,
        old_status: SessionStatus,
        new_status: SessionStatus,
    },

    /// A new scannable code is available
    AuthCodeIssued { session_id: String },

    /// Handshake completed
    Connected {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        identity: Option<String>,
    },

    /// Reconnection timer armed
    ReconnectScheduled {
        session_id: String,
        attempt: u32,
        delay_ms: u64,
    },

    /// Session left the registry for good
    Terminated {
        session_id: String,
        cause: TerminationCause,
    },
}

impl SessionEvent {
    /// Get the session ID from any event
    pub fn session_id(&self) -> &str {
        match self {
            Self::StatusChanged { session_id, .. } => session_id,
            Self::AuthCodeIssued { session_id } => session_id,
            Self::Connected { session_id, .. } => session_id,
            Self::ReconnectScheduled { session_id, .. } => session_id,
            Self::Terminated { session_id, .. } => session_id,
        }
    }

    /// Event name scoped to the session, e.g. `session-status:u1`
    pub fn event_name(&self) -> String {
        format!("{}:{}", self.global_event_name(), self.session_id())
    }

    pub fn global_event_name(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "session-status",
            Self::AuthCodeIssued { .. } => "session-auth-code",
            Self::Connected { .. } => "session-connected",
            Self::ReconnectScheduled { .. } => "session-reconnect",
            Self::Terminated { .. } => "session-terminated",
        }
    }
}

/// Log every event until the channel closes
pub fn spawn_event_logger(mut rx: broadcast::Receiver<SessionEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match &event {
                    SessionEvent::Connected { identity, .. } => {
                        info!("{} identity={}", event.event_name(), identity.as_deref().unwrap_or("-"))
                    }
                    SessionEvent::Terminated { cause, .. } => {
                        info!("{} cause={:?}", event.event_name(), cause)
                    }
                    SessionEvent::StatusChanged { old_status, new_status, .. } => {
                        debug!("{} {} -> {}", event.event_name(), old_status, new_status)
                    }
                    _ => debug!("{}", event.event_name()),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event logger lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
