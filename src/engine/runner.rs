//! Sampling loop on a dedicated thread
//!
//! Perception and volume calls block (external processes), so the engine
//! runs on its own OS thread rather than on the async runtime. Observers get
//! a `watch` snapshot after every tick; the `enabled` flag is the only thing
//! they may change, and the loop reads it once at the start of each tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{error, info};

use super::pipeline::{Engine, Snapshot};
use crate::actuator::VolumeControl;
use crate::perception::FrameSource;

/// Errors from starting or stopping the sampling loop
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("sampling loop is already running")]
    AlreadyRunning,

    #[error("failed to spawn sampling thread: {0}")]
    ThreadSpawn(String),

    #[error("sampling thread panicked")]
    Panicked,
}

/// Handle observers use to read state and toggle detection
#[derive(Debug, Clone)]
pub struct EngineControl {
    enabled: Arc<AtomicBool>,
    snapshot: watch::Receiver<Snapshot>,
}

impl EngineControl {
    pub(crate) fn new(enabled: Arc<AtomicBool>, snapshot: watch::Receiver<Snapshot>) -> Self {
        Self { enabled, snapshot }
    }

    /// Request detection on or off; applied at the next tick boundary
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Most recently published engine state
    pub fn snapshot(&self) -> Snapshot {
        *self.snapshot.borrow()
    }
}

/// Owns the sampling thread
pub struct EngineRunner {
    running: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
    poll_interval: Duration,
    handle: Option<JoinHandle<u8>>,
}

impl EngineRunner {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            enabled: Arc::new(AtomicBool::new(true)),
            poll_interval,
            handle: None,
        }
    }

    /// Move `engine` onto the sampling thread and start ticking
    pub fn start<S, V>(&mut self, mut engine: Engine<S, V>) -> Result<EngineControl, EngineError>
    where
        S: FrameSource + Send + 'static,
        V: VolumeControl + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }

        self.enabled.store(engine.is_enabled(), Ordering::SeqCst);
        let (snapshot_tx, snapshot_rx) = watch::channel(engine.snapshot());

        let running = Arc::clone(&self.running);
        let enabled = Arc::clone(&self.enabled);
        let poll_interval = self.poll_interval;

        let handle = thread::Builder::new()
            .name("sampling-loop".to_string())
            .spawn(move || {
                info!(?poll_interval, "sampling loop started");

                while running.load(Ordering::SeqCst) {
                    let started = Instant::now();

                    engine.set_enabled(enabled.load(Ordering::SeqCst), started);
                    engine.tick(started);
                    engine.resync(started);
                    snapshot_tx.send_replace(engine.snapshot());

                    if let Some(rest) = poll_interval.checked_sub(started.elapsed()) {
                        thread::sleep(rest);
                    }
                }

                info!("sampling loop stopped");
                engine.remembered_volume()
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                EngineError::ThreadSpawn(e.to_string())
            })?;

        self.handle = Some(handle);
        Ok(EngineControl::new(Arc::clone(&self.enabled), snapshot_rx))
    }

    /// Check if the loop is currently running
    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop after the in-flight tick and return the final remembered volume
    ///
    /// No volume command is issued on the way out.
    pub fn stop(&mut self) -> Result<Option<u8>, EngineError> {
        self.running.store(false, Ordering::SeqCst);
        let Some(handle) = self.handle.take() else {
            return Ok(None);
        };
        handle.join().map(Some).map_err(|_| {
            error!("sampling thread panicked");
            EngineError::Panicked
        })
    }
}

impl Drop for EngineRunner {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::broadcast;

    use crate::actuator::FakeVolume;
    use crate::config::Settings;
    use crate::engine::ScriptedSource;
    use crate::perception::Sample;
    use crate::state::Engagement;

    fn wait_for(control: &EngineControl, what: impl Fn(&Snapshot) -> bool) -> Snapshot {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = control.snapshot();
            if what(&snapshot) {
                return snapshot;
            }
            assert!(Instant::now() < deadline, "timed out waiting, last {snapshot:?}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_runner_lifecycle() {
        let settings = Settings {
            on_frames: 2,
            resync_interval_ms: 5,
            ..Settings::default()
        };
        let (tx, _rx) = broadcast::channel(1024);
        let volume = FakeVolume::at(30);
        let source = ScriptedSource::repeating(Sample::face(0.95));
        let engine = Engine::new(
            &settings,
            Engagement::NotEngaged,
            source,
            volume.clone(),
            tx,
            Instant::now(),
        )
        .unwrap();

        let mut runner = EngineRunner::new(Duration::from_millis(1));
        let control = runner.start(engine).unwrap();
        assert!(runner.is_running());

        wait_for(&control, |s| s.state == Engagement::Engaged);
        assert_eq!(volume.0.lock().unwrap().writes.first(), Some(&50));

        // User picks a new level; the resync cadence remembers it
        volume.0.lock().unwrap().level = 42;
        wait_for(&control, |s| s.remembered_volume == 42);

        control.set_enabled(false);
        wait_for(&control, |s| !s.enabled);
        let writes = volume.0.lock().unwrap().writes.len();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(volume.0.lock().unwrap().writes.len(), writes);

        assert_eq!(runner.stop().unwrap(), Some(42));
        assert!(!runner.is_running());
        assert_eq!(runner.stop().unwrap(), None);
    }

    #[test]
    fn test_start_twice_rejected() {
        let (tx, _rx) = broadcast::channel(16);
        let build = |tx: broadcast::Sender<_>| {
            Engine::new(
                &Settings::default(),
                Engagement::NotEngaged,
                ScriptedSource::repeating(Sample::no_face()),
                FakeVolume::default(),
                tx,
                Instant::now(),
            )
            .unwrap()
        };
        let mut runner = EngineRunner::new(Duration::from_millis(5));
        runner.start(build(tx.clone())).unwrap();
        assert!(matches!(
            runner.start(build(tx)),
            Err(EngineError::AlreadyRunning)
        ));
        runner.stop().unwrap();
    }
}
