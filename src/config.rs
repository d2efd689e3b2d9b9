//! Configuration loading and management
//!
//! `Config` locates the daemon's files; `Settings` is the tunable snapshot
//! persisted as JSON in the data directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors detected while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("HOME is not set")]
    NoHome,

    #[error("smile_off_threshold ({off}) must be below smile_on_threshold ({on})")]
    ThresholdOrder { on: f64, off: f64 },

    #[error("{name} must be within [0, 1], got {value}")]
    ThresholdRange { name: &'static str, value: f64 },

    #[error("ema_beta must be strictly between 0 and 1, got {0}")]
    EmaBeta(f64),

    #[error("{0} must be at least 1")]
    ZeroFrames(&'static str),

    #[error("{name} must be within 0..=100, got {value}")]
    VolumeRange { name: &'static str, value: u8 },

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("detector_command is empty")]
    EmptyDetector,

    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// JSON settings file
    pub settings_path: PathBuf,

    /// Settings in effect for this run (file contents plus CLI overrides)
    pub settings: Settings,
}

impl Config {
    /// Load configuration from `$HOME/.local/share/smile-volume`
    pub fn load() -> Result<Self, ConfigError> {
        let home = std::env::var("HOME").map_err(|_| ConfigError::NoHome)?;
        let data_dir = PathBuf::from(&home)
            .join(".local")
            .join("share")
            .join("smile-volume");
        Self::load_from(data_dir)
    }

    /// Load configuration rooted at an explicit data directory
    pub fn load_from(data_dir: PathBuf) -> Result<Self, ConfigError> {
        let socket_path = data_dir.join("daemon.sock");
        let settings_path = data_dir.join("config.json");
        let settings = Settings::read(&settings_path)?;

        Ok(Self {
            socket_path,
            data_dir,
            settings_path,
            settings,
        })
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_dir).map_err(|source| ConfigError::Io {
            path: self.data_dir.clone(),
            source,
        })
    }

    /// Write new calibration thresholds to disk, keeping every other stored key
    pub fn store_thresholds(&self, on: f64, off: f64) -> Result<(), ConfigError> {
        let mut stored = Settings::read(&self.settings_path)?;
        stored.smile_on_threshold = on;
        stored.smile_off_threshold = off;
        stored.validate()?;
        self.ensure_dirs()?;
        stored.write(&self.settings_path)
    }

    /// Persist the remembered restore level for the next run
    ///
    /// Only `last_nonzero_volume` is updated; CLI overrides of this run are
    /// not written back.
    pub fn store_last_nonzero_volume(&self, level: u8) -> Result<(), ConfigError> {
        if level == 0 {
            return Ok(());
        }
        let mut stored = Settings::read(&self.settings_path)?;
        stored.last_nonzero_volume = level.clamp(1, 100);
        self.ensure_dirs()?;
        stored.write(&self.settings_path)
    }
}

/// Tunable parameters of the detection pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub smile_on_threshold: f64,
    pub smile_off_threshold: f64,
    pub on_frames: u32,
    pub off_frames: u32,
    pub camera_index: u32,
    pub poll_interval_ms: u64,
    pub face_timeout_ms: u64,
    pub ema_beta: f64,
    /// Restore level used when no nonzero volume has been observed yet
    pub default_restore_volume: u8,
    pub last_nonzero_volume: u8,
    /// Window in which an identical volume command is suppressed
    pub min_command_interval_ms: u64,
    pub resync_interval_ms: u64,
    /// Upper bound for a single perception or volume call
    pub call_timeout_ms: u64,
    /// Detector program and its arguments
    pub detector_command: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            smile_on_threshold: 0.5,
            smile_off_threshold: 0.15,
            on_frames: 3,
            off_frames: 5,
            camera_index: 0,
            poll_interval_ms: 30,
            face_timeout_ms: 800,
            ema_beta: 0.7,
            default_restore_volume: 50,
            last_nonzero_volume: 50,
            min_command_interval_ms: 250,
            resync_interval_ms: 1000,
            call_timeout_ms: 500,
            detector_command: vec!["smile-detector".to_string()],
        }
    }
}

impl Settings {
    /// Read settings from disk, falling back to defaults when the file is absent
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Write settings as pretty-printed JSON
    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("smile_on_threshold", self.smile_on_threshold),
            ("smile_off_threshold", self.smile_off_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ThresholdRange { name, value });
            }
        }
        if self.smile_on_threshold <= self.smile_off_threshold {
            return Err(ConfigError::ThresholdOrder {
                on: self.smile_on_threshold,
                off: self.smile_off_threshold,
            });
        }
        if !(self.ema_beta > 0.0 && self.ema_beta < 1.0) {
            return Err(ConfigError::EmaBeta(self.ema_beta));
        }
        if self.on_frames == 0 {
            return Err(ConfigError::ZeroFrames("on_frames"));
        }
        if self.off_frames == 0 {
            return Err(ConfigError::ZeroFrames("off_frames"));
        }
        for (name, value) in [
            ("default_restore_volume", self.default_restore_volume),
            ("last_nonzero_volume", self.last_nonzero_volume),
        ] {
            if value > 100 {
                return Err(ConfigError::VolumeRange { name, value });
            }
        }
        for (name, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("face_timeout_ms", self.face_timeout_ms),
            ("resync_interval_ms", self.resync_interval_ms),
            ("call_timeout_ms", self.call_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        if self.detector_command.is_empty() {
            return Err(ConfigError::EmptyDetector);
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn face_timeout(&self) -> Duration {
        Duration::from_millis(self.face_timeout_ms)
    }

    pub fn min_command_interval(&self) -> Duration {
        Duration::from_millis(self.min_command_interval_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}
