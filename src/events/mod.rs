//! Events module for engine notifications
//!
//! Committed transitions, enable toggles and per-tick diagnostics are
//! broadcast as `EngineEvent`s. Diagnostics describe recovered failures; none
//! of them stop the sampling loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{Engagement, Transition};

/// Events emitted by the engine while it runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The debounced state changed
    Transition {
        from: Engagement,
        to: Engagement,
        at: DateTime<Utc>,
    },

    /// Detection was paused or resumed
    EnabledChanged { enabled: bool },

    /// A new restore level was picked up from the system volume
    VolumeRemembered { level: u8 },

    /// The perception source failed for this tick
    CaptureFailed { message: String },

    /// A volume write failed; it will be attempted again next tick
    CommandFailed { target: u8, message: String },

    /// Reading the system volume failed; the remembered level is stale
    ResyncFailed { message: String },
}

impl EngineEvent {
    /// Whether this event reports a recovered failure
    pub fn is_diagnostic(&self) -> bool {
        matches!(
            self,
            EngineEvent::CaptureFailed { .. }
                | EngineEvent::CommandFailed { .. }
                | EngineEvent::ResyncFailed { .. }
        )
    }
}

impl From<Transition> for EngineEvent {
    fn from(t: Transition) -> Self {
        EngineEvent::Transition {
            from: t.from,
            to: t.to,
            at: t.at,
        }
    }
}

impl std::fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::Transition { from, to, .. } => write!(f, "TRANSITION ({from} -> {to})"),
            EngineEvent::EnabledChanged { enabled } => {
                write!(f, "{}", if *enabled { "ENABLED" } else { "DISABLED" })
            }
            EngineEvent::VolumeRemembered { level } => write!(f, "VOLUME_REMEMBERED ({level}%)"),
            EngineEvent::CaptureFailed { message } => write!(f, "CAPTURE_FAILED: {message}"),
            EngineEvent::CommandFailed { target, message } => {
                write!(f, "COMMAND_FAILED ({target}%): {message}")
            }
            EngineEvent::ResyncFailed { message } => write!(f, "RESYNC_FAILED: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = EngineEvent::CommandFailed {
            target: 0,
            message: "osascript exited".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("command_failed"));
        assert!(json.contains("osascript exited"));
    }

    #[test]
    fn test_transition_deserialization() {
        let json = r#"{
            "type": "transition",
            "from": "not_engaged",
            "to": "engaged",
            "at": "2026-01-02T03:04:05Z"
        }"#;
        let event: EngineEvent = serde_json::from_str(json).unwrap();
        match event {
            EngineEvent::Transition { from, to, .. } => {
                assert_eq!(from, Engagement::NotEngaged);
                assert_eq!(to, Engagement::Engaged);
            }
            other => panic!("unexpected event: {other}"),
        }
    }

    #[test]
    fn test_diagnostic_classification() {
        assert!(EngineEvent::ResyncFailed { message: String::new() }.is_diagnostic());
        assert!(!EngineEvent::EnabledChanged { enabled: true }.is_diagnostic());
    }
}
