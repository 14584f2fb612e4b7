//! Messaging Network Protocol Seam
//!
//! The wire protocol itself lives outside this crate. This module defines
//! the connection interface the session layer drives, plus:
//! - close-reason classification
//! - network address normalization
//! - a process bridge that hosts the protocol library out of process

pub mod address;
pub mod bridge;
pub mod connection;
pub mod error;

#[cfg(test)]
pub(crate) mod fake;

pub use address::{identity_from_user, normalize_recipient};
pub use bridge::BridgeConnector;
pub use connection::{CloseReason, ConnectRequest, Connection, ConnectionEvent, Connector, Link};
pub use error::{ProtocolError, ProtocolResult};
