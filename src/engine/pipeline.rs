//! Per-tick detection pipeline
//!
//! sample -> smoother -> hysteresis -> debounce -> actuator, plus an
//! independent resynchronization timer that picks up user volume changes
//! while engaged. Callers pass `now` so timing is deterministic under test.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::actuator::{ActuatorController, CommandError, CommandOutcome, VolumeControl};
use crate::config::{ConfigError, Settings};
use crate::events::EngineEvent;
use crate::perception::{FrameSource, Sample};
use crate::signal::{classify, Smoother, Thresholds};
use crate::state::{DebounceMachine, Engagement};

/// Read-only view of the engine for presentation layers
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: Engagement,
    pub enabled: bool,
    pub remembered_volume: u8,
    pub smoothed: Option<f64>,
}

/// Fixed-interval timer driven by externally supplied instants
#[derive(Debug, Clone)]
pub struct Cadence {
    interval: Duration,
    next_due: Instant,
}

impl Cadence {
    pub fn new(interval: Duration, start: Instant) -> Self {
        Self {
            interval,
            next_due: start + interval,
        }
    }

    /// True at most once per interval; rearms from `now`
    pub fn due(&mut self, now: Instant) -> bool {
        if now < self.next_due {
            return false;
        }
        self.next_due = now + self.interval;
        true
    }
}

/// Time since a face was last reported
#[derive(Debug, Clone)]
struct FaceAbsenceTimer {
    timeout: Duration,
    last_seen: Instant,
}

impl FaceAbsenceTimer {
    fn new(timeout: Duration, start: Instant) -> Self {
        Self {
            timeout,
            last_seen: start,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) > self.timeout
    }

    /// Record a face; true if it ends an expired absence
    fn saw_face(&mut self, now: Instant) -> bool {
        let reacquired = self.expired(now);
        self.last_seen = now;
        reacquired
    }

    fn restart(&mut self, now: Instant) {
        self.last_seen = now;
    }
}

/// The detection engine; owns every piece of mutable pipeline state
pub struct Engine<S, V> {
    source: S,
    smoother: Smoother,
    thresholds: Thresholds,
    machine: DebounceMachine,
    controller: ActuatorController<V>,
    face: FaceAbsenceTimer,
    resync: Cadence,
    enabled: bool,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl<S: FrameSource, V: VolumeControl> Engine<S, V> {
    /// Build an engine from validated settings
    pub fn new(
        settings: &Settings,
        initial: Engagement,
        source: S,
        volume: V,
        event_tx: broadcast::Sender<EngineEvent>,
        start: Instant,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;

        Ok(Self {
            source,
            smoother: Smoother::new(settings.ema_beta)?,
            thresholds: Thresholds::new(settings.smile_on_threshold, settings.smile_off_threshold)?,
            machine: DebounceMachine::new(initial, settings.on_frames, settings.off_frames)?,
            controller: ActuatorController::new(
                volume,
                settings.last_nonzero_volume,
                settings.default_restore_volume,
                settings.min_command_interval(),
            ),
            face: FaceAbsenceTimer::new(settings.face_timeout(), start),
            resync: Cadence::new(settings.resync_interval(), start),
            enabled: true,
            event_tx,
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> Engagement {
        self.machine.state()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn remembered_volume(&self) -> u8 {
        self.controller.remembered_volume()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.machine.state(),
            enabled: self.enabled,
            remembered_volume: self.controller.remembered_volume(),
            smoothed: self.smoother.value(),
        }
    }

    /// Pause or resume detection; takes effect from the next tick
    pub fn set_enabled(&mut self, enabled: bool, now: Instant) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        info!(enabled, "detection toggled");

        if enabled {
            // Time spent paused is not face absence, and old runs are stale
            self.face.restart(now);
            self.machine.clear_pending();
        }
        self.emit(EngineEvent::EnabledChanged { enabled });
    }

    /// Process one tick
    pub fn tick(&mut self, now: Instant) {
        if !self.enabled {
            return;
        }

        let intent = match self.source.sample_frame() {
            Ok(sample) => self.intent_for(sample, now),
            Err(e) => {
                warn!(?e, "frame capture failed");
                self.emit(EngineEvent::CaptureFailed {
                    message: e.to_string(),
                });
                self.face.expired(now).then_some(Engagement::NotEngaged)
            }
        };

        if let Some(transition) = intent.and_then(|c| self.machine.update(c)) {
            self.emit(transition.into());
            let result = self.controller.on_transition(transition.to, now);
            self.report_command(result, self.controller.target_for(transition.to));
        } else if let Some(target) = self.controller.pending_target() {
            if let Some(result) = self.controller.retry_pending(now) {
                self.report_command(result, target);
            }
        }
    }

    /// Periodic resynchronization of the remembered level
    pub fn resync(&mut self, now: Instant) {
        if !self.enabled || !self.resync.due(now) {
            return;
        }
        match self.controller.resync(self.machine.state()) {
            Ok(Some(level)) => {
                info!(level, "remembered new restore volume");
                self.emit(EngineEvent::VolumeRemembered { level });
            }
            Ok(None) => {}
            Err(e) => {
                // Keep the stale level; the next cadence tries again
                warn!(?e, "volume resync failed");
                self.emit(EngineEvent::ResyncFailed {
                    message: e.to_string(),
                });
            }
        }
    }

    fn intent_for(&mut self, sample: Sample, now: Instant) -> Option<Engagement> {
        let state = self.machine.state();

        if let (true, Some(raw)) = (sample.face_present, sample.confidence) {
            let smoothed = if self.face.saw_face(now) {
                debug!(raw, "face reacquired, restarting average");
                self.smoother.reset(raw);
                self.smoother.value().unwrap_or(raw)
            } else {
                self.smoother.update(raw)
            };
            debug!(raw, smoothed, "sample");
            return Some(classify(smoothed, state, &self.thresholds));
        }

        if self.face.expired(now) {
            return Some(Engagement::NotEngaged);
        }

        // Brief loss: hold the last average
        self.smoother
            .value()
            .map(|held| classify(held, state, &self.thresholds))
    }

    fn report_command(&self, result: Result<CommandOutcome, CommandError>, target: u8) {
        match result {
            Ok(CommandOutcome::Issued(level)) => debug!(level, "volume command issued"),
            Ok(CommandOutcome::Suppressed(level)) => debug!(level, "volume command suppressed"),
            Err(e) => self.emit(EngineEvent::CommandFailed {
                target,
                message: e.to_string(),
            }),
        }
    }

    fn emit(&self, event: EngineEvent) {
        debug!(%event, "emitting engine event");
        let _ = self.event_tx.send(event);
    }
}
