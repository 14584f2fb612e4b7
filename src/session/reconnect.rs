//! Reconnection Policy
//!
//! Decides what happens after a connection closes: retry after a delay, or
//! tear the session down. A logged-out close is always terminal.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::CloseReason;

/// Outcome of consulting the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry(Duration),
    Terminate,
}

/// Retry schedule. The defaults reproduce a fixed three second delay with
/// no attempt cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    /// Growth factor per consecutive attempt; 1.0 keeps the delay fixed
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Give up after this many consecutive attempts; unbounded when unset
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 3000,
            multiplier: 1.0,
            max_delay_ms: 60_000,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Fixed delay, unbounded attempts
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            initial_delay_ms: ms,
            multiplier: 1.0,
            max_delay_ms: ms,
            max_attempts: None,
        }
    }

    /// Delay before attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = scaled.min(self.max_delay_ms.max(self.initial_delay_ms) as f64);
        Duration::from_millis(capped as u64)
    }

    /// Decide how to react to a close. `attempt` is the number of the
    /// reconnection attempt that would follow (1 for the first retry).
    pub fn decide(&self, reason: CloseReason, attempt: u32) -> ReconnectDecision {
        if reason.is_logged_out() {
            return ReconnectDecision::Terminate;
        }

        match self.max_attempts {
            Some(max) if attempt > max => ReconnectDecision::Terminate,
            _ => ReconnectDecision::Retry(self.delay_for(attempt)),
        }
    }
}
