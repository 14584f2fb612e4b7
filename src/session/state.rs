//! Session State
//!
//! Lifecycle status and the observable snapshot of one session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Connection being opened
    #[serde(rename = "connecting")]
    Connecting,
    /// A scannable code is waiting to be scanned
    #[serde(rename = "qr_ready")]
    AwaitingAuthentication,
    /// Linked and online
    #[serde(rename = "connected")]
    Connected,
    /// Dropped; a reconnection is pending or in flight
    #[serde(rename = "reconnecting")]
    Reconnecting,
    /// Terminal
    #[serde(rename = "disconnected")]
    Disconnected,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::Connecting
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::AwaitingAuthentication => write!(f, "qr_ready"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub status: SessionStatus,
    /// Rendered challenge; only while awaiting authentication
    pub auth_code: Option<String>,
    /// Linked phone number; from first connect until terminal disconnect
    pub identity: Option<String>,
    /// Reconnection attempts since the last successful connect
    pub reconnect_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: SessionStatus::Connecting,
            auth_code: None,
            identity: None,
            reconnect_attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Snapshot reported for an id with no live session
    pub fn absent(id: impl Into<String>) -> Self {
        let mut snapshot = Self::new(id);
        snapshot.status = SessionStatus::Disconnected;
        snapshot
    }

    fn touch(&mut self, status: SessionStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// A new challenge arrived. A fresh link replaces any earlier identity.
    pub fn set_challenge(&mut self, code: String) {
        self.auth_code = Some(code);
        self.identity = None;
        self.touch(SessionStatus::AwaitingAuthentication);
    }

    pub fn set_connected(&mut self, identity: Option<String>) {
        self.auth_code = None;
        if identity.is_some() {
            self.identity = identity;
        }
        self.reconnect_attempts = 0;
        self.touch(SessionStatus::Connected);
    }

    pub fn set_reconnecting(&mut self) {
        self.auth_code = None;
        self.touch(SessionStatus::Reconnecting);
    }

    pub fn set_disconnected(&mut self) {
        self.auth_code = None;
        self.identity = None;
        self.touch(SessionStatus::Disconnected);
    }

    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }

    pub fn is_terminal(&self) -> bool {
        self.status == SessionStatus::Disconnected
    }
}
