//! Client-visible push events
//!
//! Controllers multicast state to subscribed sessions as named events with
//! a JSON payload, mirroring the client protocol (`controller:state`,
//! `sender:status`, `workflow:state`, ...). Per-subscriber delivery order
//! is preserved; there is no cross-subscriber ordering guarantee.

use serde::Serialize;
use serde_json::Value;

/// One event pushed to a subscribed client session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Push {
    /// Event name as seen by clients
    pub event: String,
    /// JSON payload
    pub payload: Value,
}

impl Push {
    /// Build a push event
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}
