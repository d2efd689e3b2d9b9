//! Rate-limited volume controller
//!
//! Turns committed engagement transitions into volume commands, remembers the
//! last nonzero level observed while engaged, and restores it on the next
//! engagement.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::volume::{CommandError, VolumeControl};
use crate::state::Engagement;

/// Most recently issued command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRecord {
    pub target: u8,
    pub issued_at: Instant,
}

/// Result of a command request that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The external call was made
    Issued(u8),
    /// Same target was issued within the minimum interval
    Suppressed(u8),
}

/// Owns every external volume write
pub struct ActuatorController<V> {
    volume: V,
    /// Last nonzero level seen while engaged
    remembered: u8,
    /// Fallback restore level while nothing has been remembered
    default_restore: u8,
    min_interval: Duration,
    last_command: Option<CommandRecord>,
    /// Target of a command that failed and has not yet been applied
    pending: Option<u8>,
}

impl<V: VolumeControl> ActuatorController<V> {
    pub fn new(volume: V, remembered: u8, default_restore: u8, min_interval: Duration) -> Self {
        Self {
            volume,
            remembered: remembered.min(100),
            default_restore: default_restore.min(100),
            min_interval,
            last_command: None,
            pending: None,
        }
    }

    pub fn remembered_volume(&self) -> u8 {
        self.remembered
    }

    #[cfg(test)]
    pub fn last_command(&self) -> Option<CommandRecord> {
        self.last_command
    }

    /// Target still waiting on a successful write
    pub fn pending_target(&self) -> Option<u8> {
        self.pending
    }

    /// Level a transition into `state` commands
    pub fn target_for(&self, state: Engagement) -> u8 {
        match state {
            Engagement::NotEngaged => 0,
            Engagement::Engaged if self.remembered == 0 => self.default_restore,
            Engagement::Engaged => self.remembered,
        }
    }

    /// Apply a committed transition
    pub fn on_transition(
        &mut self,
        to: Engagement,
        now: Instant,
    ) -> Result<CommandOutcome, CommandError> {
        let target = self.target_for(to);
        info!(state = %to, target, "applying transition");
        self.pending = None;
        self.request(target, now)
    }

    /// Re-attempt a previously failed command, if any
    pub fn retry_pending(&mut self, now: Instant) -> Option<Result<CommandOutcome, CommandError>> {
        let target = self.pending?;
        debug!(target, "retrying failed volume command");
        Some(self.request(target, now))
    }

    /// Issue `target`, subject to the identical-command interval
    pub fn request(&mut self, target: u8, now: Instant) -> Result<CommandOutcome, CommandError> {
        let target = target.min(100);

        if let Some(last) = self.last_command {
            let elapsed = now.saturating_duration_since(last.issued_at);
            if last.target == target && elapsed < self.min_interval {
                debug!(target, "suppressing repeated volume command");
                return Ok(CommandOutcome::Suppressed(target));
            }
        }

        match self.volume.set_volume(target) {
            Ok(()) => {
                self.last_command = Some(CommandRecord {
                    target,
                    issued_at: now,
                });
                self.pending = None;
                Ok(CommandOutcome::Issued(target))
            }
            Err(e) => {
                warn!(?e, target, "volume command failed");
                self.pending = Some(target);
                Err(e)
            }
        }
    }

    /// Read the external level while engaged and remember it if nonzero
    ///
    /// Returns the newly remembered level, if it changed. A failed read leaves
    /// the remembered level untouched.
    pub fn resync(&mut self, state: Engagement) -> Result<Option<u8>, CommandError> {
        if state != Engagement::Engaged {
            return Ok(None);
        }
        let current = self.volume.get_volume()?.min(100);
        if current == 0 || current == self.remembered {
            return Ok(None);
        }
        debug!(from = self.remembered, to = current, "remembering external volume");
        self.remembered = current;
        Ok(Some(current))
    }
}
