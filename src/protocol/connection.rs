//! Protocol Connection Abstraction
//!
//! The messaging network is reached through an opaque library. The gateway
//! only needs three things from it:
//! - open a connection for a session, resuming from stored credentials
//! - send a text message / log out over a live connection
//! - an ordered stream of connection events

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::ProtocolResult;
use crate::credentials::{CredentialBlob, CredentialUpdate};

/// Status code the network uses when the linked device was logged out
pub const LOGGED_OUT_STATUS: u16 = 401;

/// Why a connection closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "camelCase")]
pub enum CloseReason {
    /// The device was unlinked; stored credentials are no longer valid
    LoggedOut,
    /// Anything else: network drop, restart request, stream error...
    Transient(Option<u16>),
}

impl CloseReason {
    /// Classify a close by the status code the protocol layer reported
    pub fn from_status_code(code: Option<u16>) -> Self {
        match code {
            Some(LOGGED_OUT_STATUS) => Self::LoggedOut,
            other => Self::Transient(other),
        }
    }

    pub fn is_logged_out(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoggedOut => write!(f, "logged out"),
            Self::Transient(Some(code)) => write!(f, "transient ({})", code),
            Self::Transient(None) => write!(f, "transient"),
        }
    }
}

/// Events delivered by a connection, in protocol order
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A new authentication challenge to present as a scannable code
    Challenge { payload: String },
    /// Handshake completed; `user` is the linked account's address
    Open { user: String },
    /// Connection closed
    Closed { reason: CloseReason },
    /// The protocol layer rotated its key material
    CredentialsUpdated(CredentialUpdate),
}

impl ConnectionEvent {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Challenge { .. } => "challenge",
            Self::Open { .. } => "open",
            Self::Closed { .. } => "closed",
            Self::CredentialsUpdated(_) => "credentials",
        }
    }
}

/// Parameters for opening a connection
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub session_id: String,
    /// Previously persisted material; empty for a first link
    pub credentials: CredentialBlob,
    /// Name the linked device shows on the phone
    pub client_name: String,
}

/// A freshly opened connection plus its event stream
pub struct Link {
    pub connection: Box<dyn Connection>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// Opens protocol connections
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection. Events start flowing on the returned receiver.
    async fn connect(&self, request: ConnectRequest) -> ProtocolResult<Link>;

    /// Connector name for logging
    fn connector_type(&self) -> &'static str;
}

/// A live protocol connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send a text message to a fully qualified network address
    async fn send_text(&self, to: &str, text: &str) -> ProtocolResult<()>;

    /// Unlink this device from the account
    async fn logout(&self) -> ProtocolResult<()>;

    /// Release the connection without logging out. Ends the event stream.
    async fn close(&self) -> ProtocolResult<()>;
}
