//! Session Management Module
//!
//! Multi-tenant connection sessions:
//! - one state machine per tenant, driven by ordered connection events
//! - a concurrent registry that never holds two sessions for one id
//! - reconnection policy separating transient drops from logouts
//! - lifecycle events for observers

pub mod error;
pub mod events;
pub mod machine;
pub mod reconnect;
pub mod registry;
pub mod state;

use regex::Regex;
use std::sync::LazyLock;

pub use error::{SessionError, SessionResult};
pub use events::{spawn_event_logger, SessionEvent, TerminationCause};
pub use machine::Session;
pub use reconnect::{ReconnectDecision, ReconnectPolicy};
pub use registry::SessionRegistry;
pub use state::{SessionSnapshot, SessionStatus};

/// Longest accepted session id
pub const MAX_SESSION_ID_LEN: usize = 128;

static SESSION_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._@+-]+$").expect("valid session id pattern"));

/// Session ids name a directory on disk, so keep them to a safe alphabet
pub fn validate_session_id(id: &str) -> SessionResult<()> {
    if id.trim().is_empty() {
        return Err(SessionError::Validation("id is required".to_string()));
    }
    if id.len() > MAX_SESSION_ID_LEN {
        return Err(SessionError::Validation(format!(
            "id longer than {} characters",
            MAX_SESSION_ID_LEN
        )));
    }
    if id == "." || id == ".." || !SESSION_ID.is_match(id) {
        return Err(SessionError::Validation(format!("invalid id: {}", id)));
    }
    Ok(())
}
