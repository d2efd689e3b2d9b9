//! System output volume access
//!
//! On macOS the level is read and written through AppleScript. Every call is
//! bounded so a wedged `osascript` cannot stall the sampling loop.

use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Errors from reading or writing the output volume
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("volume command timed out after {0:?}")]
    Timeout(Duration),

    #[error("volume command failed ({status}): {stderr}")]
    Failed { status: String, stderr: String },

    #[error("unexpected volume output: {0:?}")]
    Parse(String),
}

/// Read/write access to the system output level (0..=100)
pub trait VolumeControl {
    fn get_volume(&mut self) -> Result<u8, CommandError>;
    fn set_volume(&mut self, level: u8) -> Result<(), CommandError>;
}

/// `osascript`-backed volume control
#[derive(Debug, Clone)]
pub struct OsaScriptVolume {
    program: String,
    timeout: Duration,
}

const OSASCRIPT: &str = "/usr/bin/osascript";

/// Interval between exit checks while waiting on a child
const WAIT_POLL: Duration = Duration::from_millis(5);

impl OsaScriptVolume {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: OSASCRIPT.to_string(),
            timeout,
        }
    }

    fn run(&self, script: &str) -> Result<String, CommandError> {
        run_with_timeout(Command::new(&self.program).arg("-e").arg(script), self.timeout)
    }
}

impl VolumeControl for OsaScriptVolume {
    fn get_volume(&mut self) -> Result<u8, CommandError> {
        let out = self.run("output volume of (get volume settings)")?;
        parse_level(&out)
    }

    fn set_volume(&mut self, level: u8) -> Result<(), CommandError> {
        let level = level.min(100);
        debug!(level, "setting output volume");
        self.run(&format!("set volume output volume {level}"))?;
        Ok(())
    }
}

/// Parse `osascript` output into a level, clamping to 100
///
/// A muted device reports `missing value`, which is read as 0.
fn parse_level(out: &str) -> Result<u8, CommandError> {
    let trimmed = out.trim();
    if trimmed == "missing value" {
        return Ok(0);
    }
    trimmed
        .parse::<u32>()
        .map(|v| v.min(100) as u8)
        .map_err(|_| CommandError::Parse(trimmed.to_string()))
}

/// Run a command to completion, killing it once `timeout` elapses
pub(crate) fn run_with_timeout(
    cmd: &mut Command,
    timeout: Duration,
) -> Result<String, CommandError> {
    let program = format!("{:?}", cmd.get_program());
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) if Instant::now() >= deadline => {
                if let Err(e) = child.kill() {
                    warn!(?e, %program, "failed to kill timed out command");
                }
                let _ = child.wait();
                return Err(CommandError::Timeout(timeout));
            }
            Ok(None) => thread::sleep(WAIT_POLL),
            Err(source) => return Err(CommandError::Spawn { program, source }),
        }
    }

    let output = child
        .wait_with_output()
        .map_err(|source| CommandError::Spawn { program, source })?;

    if !output.status.success() {
        return Err(CommandError::Failed {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("42\n").unwrap(), 42);
        assert_eq!(parse_level("missing value").unwrap(), 0);
        assert_eq!(parse_level("250").unwrap(), 100);
        assert!(matches!(parse_level("loud"), Err(CommandError::Parse(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_timeout_captures_stdout() {
        let out = run_with_timeout(
            Command::new("sh").arg("-c").arg("echo 17"),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(out.trim(), "17");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_timeout_reports_failure() {
        let err = run_with_timeout(
            Command::new("sh").arg("-c").arg("echo nope >&2; exit 3"),
            Duration::from_secs(5),
        )
        .unwrap_err();
        match err {
            CommandError::Failed { stderr, .. } => assert_eq!(stderr, "nope"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_timeout_kills_stuck_command() {
        let started = Instant::now();
        let err = run_with_timeout(
            Command::new("sh").arg("-c").arg("sleep 5"),
            Duration::from_millis(100),
        )
        .unwrap_err();
        assert!(matches!(err, CommandError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let mut volume = OsaScriptVolume {
            program: "/nonexistent/osascript".to_string(),
            timeout: Duration::from_millis(100),
        };
        assert!(matches!(
            volume.get_volume(),
            Err(CommandError::Spawn { .. })
        ));
    }
}
