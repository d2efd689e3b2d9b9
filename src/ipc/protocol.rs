//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::Snapshot;
use crate::events::EngineEvent;
use crate::state::Engagement;

/// Largest accepted message body
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// Requests from UI to daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Request current daemon status
    GetStatus,

    /// Pause or resume detection
    SetEnabled { enabled: bool },

    /// Ping to check connectivity
    Ping,

    /// Subscribe to state change notifications
    Subscribe,
}

/// Responses from daemon to UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Current daemon status
    Status(DaemonStatus),

    /// Enabled flag accepted; applied at the next tick
    Enabled { enabled: bool },

    /// Pong response to ping
    Pong,

    /// Subscription confirmed
    Subscribed,

    /// Error response
    Error { code: String, message: String },
}

/// Push notification from daemon to UI (for subscribed clients)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Debounced state has changed
    StateChanged {
        state: Engagement,
        previous: Engagement,
        at: DateTime<Utc>,
    },

    /// Detection was paused or resumed
    EnabledChanged { enabled: bool },

    /// A recovered failure or informational engine event
    Diagnostic { message: String },
}

impl From<&EngineEvent> for Notification {
    fn from(event: &EngineEvent) -> Self {
        match event {
            EngineEvent::Transition { from, to, at } => Notification::StateChanged {
                state: *to,
                previous: *from,
                at: *at,
            },
            EngineEvent::EnabledChanged { enabled } => {
                Notification::EnabledChanged { enabled: *enabled }
            }
            other => Notification::Diagnostic {
                message: other.to_string(),
            },
        }
    }
}

/// Full daemon status snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Daemon version
    pub version: String,

    /// Debounced engagement state
    pub state: Engagement,

    /// Whether detection is active
    pub enabled: bool,

    /// Level restored on the next engagement
    pub remembered_volume: u8,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl DaemonStatus {
    pub fn from_snapshot(snapshot: &Snapshot, uptime_secs: u64) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: snapshot.state,
            enabled: snapshot.enabled,
            remembered_volume: snapshot.remembered_volume,
            uptime_secs,
        }
    }
}
