//! smile-volume-daemon: unmute system audio while you smile
//!
//! This daemon runs as a LaunchAgent and provides:
//! - A sampling loop fed by an external smile detector process
//! - EMA smoothing, dual-threshold hysteresis and frame debouncing
//! - Rate-limited system volume control with restore-level memory
//! - IPC server for menu bar app communication
//!
//! Scope:
//! - Face detection and emotion inference live in the detector program
//! - The menu bar app is a separate client of the IPC socket

mod actuator;
mod calibration;
mod config;
mod engine;
mod events;
mod ipc;
mod lifecycle;
mod perception;
mod signal;
mod state;

use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::actuator::OsaScriptVolume;
use crate::config::{Config, Settings};
use crate::engine::{Engine, EngineRunner};
use crate::events::EngineEvent;
use crate::ipc::Server;
use crate::lifecycle::ShutdownSignal;
use crate::perception::DetectorProcess;
use crate::state::Engagement;

#[derive(Parser, Debug)]
#[command(
    name = "smile-volume-daemon",
    version,
    about = "Smile-to-unmute system volume control"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    overrides: Overrides,

    /// Run without the IPC socket (no menu bar app)
    #[arg(long)]
    no_ipc: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Run the detection loop (default)
    Run,
    /// Measure neutral and smiling scores and store new thresholds
    Calibrate,
}

/// Per-run settings overrides; never written back to the config file
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Camera device index
    #[arg(long)]
    camera_index: Option<u32>,

    /// Smile ON threshold
    #[arg(long)]
    smile_on: Option<f64>,

    /// Smile OFF threshold
    #[arg(long)]
    smile_off: Option<f64>,

    /// Consecutive frames for smile ON
    #[arg(long)]
    on_frames: Option<u32>,

    /// Consecutive frames for smile OFF
    #[arg(long)]
    off_frames: Option<u32>,

    /// Polling interval (ms)
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Volume restored when no level has been remembered yet
    #[arg(long)]
    default_restore: Option<u8>,

    /// Detector program
    #[arg(long)]
    detector: Option<String>,

    /// Extra detector argument (repeatable)
    #[arg(long = "detector-arg", allow_hyphen_values = true)]
    detector_args: Vec<String>,
}

impl Overrides {
    fn apply(&self, settings: &mut Settings) {
        if let Some(v) = self.camera_index {
            settings.camera_index = v;
        }
        if let Some(v) = self.smile_on {
            settings.smile_on_threshold = v;
        }
        if let Some(v) = self.smile_off {
            settings.smile_off_threshold = v;
        }
        if let Some(v) = self.on_frames {
            settings.on_frames = v;
        }
        if let Some(v) = self.off_frames {
            settings.off_frames = v;
        }
        if let Some(v) = self.poll_interval_ms {
            settings.poll_interval_ms = v;
        }
        if let Some(v) = self.default_restore {
            settings.default_restore_volume = v;
        }
        if let Some(program) = &self.detector {
            settings.detector_command = std::iter::once(program.clone())
                .chain(self.detector_args.iter().cloned())
                .collect();
        } else if !self.detector_args.is_empty() {
            settings.detector_command.extend(self.detector_args.iter().cloned());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let fallback = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(fallback))
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "smile-volume-daemon starting"
    );

    // Load configuration; anything invalid stops us here
    let mut config = Config::load().context("failed to load configuration")?;
    cli.overrides.apply(&mut config.settings);
    config.settings.validate().context("invalid configuration")?;
    info!(path = %config.settings_path.display(), "configuration loaded");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(config, cli.no_ipc).await,
        Command::Calibrate => calibrate(config).await,
    }
}

async fn run_daemon(config: Config, no_ipc: bool) -> Result<()> {
    let settings = config.settings.clone();

    // Engine -> IPC server and event logger
    let (event_tx, _event_rx) = broadcast::channel::<EngineEvent>(64);

    let source = DetectorProcess::spawn(
        &settings.detector_command,
        settings.camera_index,
        settings.call_timeout(),
    )
    .context("failed to start smile detector")?;
    let volume = OsaScriptVolume::new(settings.call_timeout());

    let engine = Engine::new(
        &settings,
        Engagement::NotEngaged,
        source,
        volume,
        event_tx.clone(),
        Instant::now(),
    )?;

    let mut runner = EngineRunner::new(settings.poll_interval());
    let control = runner.start(engine)?;

    info!(
        on = settings.smile_on_threshold,
        off = settings.smile_off_threshold,
        restore = settings.last_nonzero_volume,
        "smile-to-unmute started"
    );

    let server = if no_ipc {
        None
    } else {
        Some(Server::with_events(&config.socket_path, control.clone(), event_tx.clone())?)
    };

    let mut event_rx = event_tx.subscribe();
    let mut shutdown = ShutdownSignal::new().context("failed to register signal handlers")?;

    info!("daemon initialized, entering main loop");

    tokio::select! {
        // Run the IPC server (accepts client connections)
        result = async {
            match &server {
                Some(server) => server.run().await,
                None => std::future::pending::<Result<()>>().await,
            }
        } => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        // Failures are already logged where they happen; trace the stream only
        _ = async {
            loop {
                match event_rx.recv().await {
                    Ok(event) => debug!(diagnostic = event.is_diagnostic(), %event, "engine event"),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "engine event receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        } => {
            info!("engine event stream closed");
        }

        // Wait for shutdown signal
        name = shutdown.wait() => {
            info!(signal = name, "shutdown signal received");
        }
    }

    // Cleanup; the last volume command stays as issued
    info!("shutting down...");

    let remembered = tokio::task::spawn_blocking(move || runner.stop())
        .await
        .context("sampling loop join failed")??;

    if let Some(server) = &server {
        server.shutdown().await;
    }

    if let Some(level) = remembered {
        match config.store_last_nonzero_volume(level) {
            Ok(()) => info!(level, "restore volume saved"),
            Err(e) => warn!(?e, "failed to save restore volume"),
        }
    }

    info!("smile-volume-daemon stopped");

    Ok(())
}

async fn calibrate(config: Config) -> Result<()> {
    let settings = config.settings.clone();

    let result = tokio::task::spawn_blocking(
        move || -> Result<calibration::CalibrationResult, calibration::CalibrationError> {
            let mut source = DetectorProcess::spawn(
                &settings.detector_command,
                settings.camera_index,
                settings.call_timeout(),
            )?;
            let stdin = std::io::stdin();
            calibration::run(
                &mut source,
                &mut stdin.lock(),
                &mut std::io::stdout(),
                calibration::PHASE_SAMPLES,
                calibration::SAMPLE_INTERVAL,
            )
        },
    )
    .await
    .context("calibration task failed")??;

    config
        .store_thresholds(result.on, result.off)
        .context("failed to save thresholds")?;
    info!(on = result.on, off = result.off, "thresholds saved to config");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "smile-volume-daemon",
            "--smile-on",
            "0.6",
            "--off-frames",
            "8",
            "--detector",
            "/opt/detector",
            "--detector-arg",
            "--model=small",
            "calibrate",
        ]);
        assert!(matches!(cli.command, Some(Command::Calibrate)));

        let mut settings = Settings::default();
        cli.overrides.apply(&mut settings);
        assert_eq!(settings.smile_on_threshold, 0.6);
        assert_eq!(settings.off_frames, 8);
        assert_eq!(settings.on_frames, 3);
        assert_eq!(
            settings.detector_command,
            vec!["/opt/detector".to_string(), "--model=small".to_string()]
        );
    }

    #[test]
    fn test_no_overrides_keeps_settings() {
        let cli = Cli::parse_from(["smile-volume-daemon", "--no-ipc"]);
        assert!(cli.no_ipc);
        assert!(cli.command.is_none());
        let mut settings = Settings::default();
        cli.overrides.apply(&mut settings);
        assert_eq!(settings, Settings::default());
    }
}
