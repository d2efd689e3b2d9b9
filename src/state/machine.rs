//! Debounced engagement state machine
//!
//! Commits a change between Engaged and NotEngaged only after the classifier
//! has agreed on the opposite state for a configured number of consecutive
//! ticks. The count depends on the direction of the change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ConfigError;

/// Binary engagement value, used both as per-tick intent and as committed state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engagement {
    /// User is smiling; audio should play
    Engaged,
    /// User is not smiling; audio should be muted
    #[default]
    NotEngaged,
}

impl std::fmt::Display for Engagement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Engagement::Engaged => write!(f, "Engaged"),
            Engagement::NotEngaged => write!(f, "NotEngaged"),
        }
    }
}

/// A committed state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: Engagement,
    pub to: Engagement,
    pub at: DateTime<Utc>,
}

/// Consecutive-frame confirmation in front of the authoritative state
#[derive(Debug, Clone)]
pub struct DebounceMachine {
    /// Current committed state
    state: Engagement,
    /// Consecutive ticks agreeing with the opposite state
    counter: u32,
    /// Ticks required to move toward Engaged
    on_frames: u32,
    /// Ticks required to move toward NotEngaged
    off_frames: u32,
}

impl DebounceMachine {
    /// Create a machine in the given initial state
    pub fn new(initial: Engagement, on_frames: u32, off_frames: u32) -> Result<Self, ConfigError> {
        if on_frames == 0 {
            return Err(ConfigError::ZeroFrames("on_frames"));
        }
        if off_frames == 0 {
            return Err(ConfigError::ZeroFrames("off_frames"));
        }
        Ok(Self {
            state: initial,
            counter: 0,
            on_frames,
            off_frames,
        })
    }

    /// Get the current state
    pub fn state(&self) -> Engagement {
        self.state
    }

    /// Consecutive ticks seen so far toward the opposite state
    #[cfg(test)]
    pub fn pending_frames(&self) -> u32 {
        self.counter
    }

    /// Drop any partially accumulated run
    pub fn clear_pending(&mut self) {
        self.counter = 0;
    }

    /// Feed one tick's candidate intent; returns the transition if one commits
    pub fn update(&mut self, candidate: Engagement) -> Option<Transition> {
        if candidate == self.state {
            self.counter = 0;
            return None;
        }

        self.counter += 1;
        let required = self.required_frames(candidate);
        debug!(
            state = %self.state,
            candidate = %candidate,
            count = self.counter,
            required,
            "debouncing"
        );

        if self.counter < required {
            return None;
        }

        let transition = Transition {
            from: self.state,
            to: candidate,
            at: Utc::now(),
        };
        self.state = candidate;
        self.counter = 0;

        info!(from = %transition.from, to = %transition.to, "state transition");
        Some(transition)
    }

    fn required_frames(&self, toward: Engagement) -> u32 {
        match toward {
            Engagement::Engaged => self.on_frames,
            Engagement::NotEngaged => self.off_frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use Engagement::{Engaged, NotEngaged};

    fn create_machine(on_frames: u32, off_frames: u32) -> DebounceMachine {
        DebounceMachine::new(NotEngaged, on_frames, off_frames).unwrap()
    }

    #[test]
    fn test_initial_state_is_explicit() {
        let sm = DebounceMachine::new(Engaged, 2, 2).unwrap();
        assert_eq!(sm.state(), Engaged);
        let sm = create_machine(2, 2);
        assert_eq!(sm.state(), NotEngaged);
    }

    #[test]
    fn test_zero_frames_rejected() {
        assert!(DebounceMachine::new(NotEngaged, 0, 3).is_err());
        assert!(DebounceMachine::new(NotEngaged, 3, 0).is_err());
    }

    #[test]
    fn test_commits_on_fourth_tick_not_earlier() {
        let mut sm = create_machine(4, 6);
        for _ in 0..3 {
            assert!(sm.update(Engaged).is_none());
            assert_eq!(sm.state(), NotEngaged);
        }
        let transition = sm.update(Engaged).unwrap();
        assert_eq!(transition.from, NotEngaged);
        assert_eq!(transition.to, Engaged);
        assert_eq!(sm.state(), Engaged);
        assert_eq!(sm.pending_frames(), 0);

        // Continued agreement never re-emits
        for _ in 0..10 {
            assert!(sm.update(Engaged).is_none());
        }
    }

    #[test]
    fn test_direction_specific_frame_counts() {
        let mut sm = create_machine(2, 5);
        sm.update(Engaged);
        assert!(sm.update(Engaged).is_some());

        for _ in 0..4 {
            assert!(sm.update(NotEngaged).is_none());
        }
        let transition = sm.update(NotEngaged).unwrap();
        assert_eq!(transition.to, NotEngaged);
    }

    #[test]
    fn test_alternating_intent_never_commits() {
        let mut sm = create_machine(2, 2);
        for i in 0..100 {
            let candidate = if i % 2 == 0 { Engaged } else { NotEngaged };
            assert!(sm.update(candidate).is_none());
        }
        assert_eq!(sm.state(), NotEngaged);
    }

    #[test]
    fn test_disagreement_resets_counter() {
        let mut sm = create_machine(3, 3);
        sm.update(Engaged);
        sm.update(Engaged);
        assert_eq!(sm.pending_frames(), 2);
        sm.update(NotEngaged);
        assert_eq!(sm.pending_frames(), 0);
        sm.update(Engaged);
        sm.update(Engaged);
        assert_eq!(sm.state(), NotEngaged);
        assert!(sm.update(Engaged).is_some());
    }

    #[test]
    fn test_default_is_not_engaged() {
        assert_eq!(Engagement::default(), NotEngaged);
    }

    #[test]
    fn test_single_frame_commits_immediately() {
        let mut sm = create_machine(1, 1);
        assert!(sm.update(Engaged).is_some());
        assert!(sm.update(NotEngaged).is_some());
    }
}
