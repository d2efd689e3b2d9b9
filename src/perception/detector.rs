//! External smile detector process
//!
//! The detector is a separate program that owns the camera and the emotion
//! model. It writes one JSON object per line on stdout:
//!
//! ```text
//! {"face_present": true, "confidence": 0.82}
//! {"face_present": false, "confidence": null}
//! ```
//!
//! A reader thread parses lines into a single-item slot; each `sample_frame`
//! call takes the newest valid sample. Unread samples are overwritten, so an
//! unsampled detector (detection paused, calibration prompt) holds at most one.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One perception result
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub face_present: bool,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[cfg(test)]
impl Sample {
    pub fn face(confidence: f64) -> Self {
        Self {
            face_present: true,
            confidence: Some(confidence),
        }
    }

    pub fn no_face() -> Self {
        Self {
            face_present: false,
            confidence: None,
        }
    }
}

/// Errors from the perception source
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to start detector {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("detector is not running")]
    Unavailable,

    #[error("no frame within {0:?}")]
    Timeout(Duration),

    #[error("malformed detector output: {0}")]
    Malformed(String),
}

/// Anything that produces one `Sample` per call
pub trait FrameSource {
    fn sample_frame(&mut self) -> Result<Sample, CaptureError>;
}

#[derive(Debug, Default)]
struct Slot {
    latest: Option<Result<Sample, CaptureError>>,
    closed: bool,
}

/// Newest-wins handoff between the reader thread and `sample_frame`
#[derive(Debug, Default)]
struct Handoff {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl Handoff {
    /// Store a parsed line; an error never displaces an unread sample
    fn publish(&self, item: Result<Sample, CaptureError>) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if item.is_ok() || !matches!(slot.latest, Some(Ok(_))) {
            slot.latest = Some(item);
        }
        drop(slot);
        self.ready.notify_one();
    }

    fn close(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.closed = true;
        drop(slot);
        self.ready.notify_one();
    }

    /// Take the stored item, waiting up to `timeout` for one to arrive
    fn take(&self, timeout: Duration) -> Result<Sample, CaptureError> {
        let guard = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut slot, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |slot| slot.latest.is_none() && !slot.closed)
            .unwrap_or_else(PoisonError::into_inner);

        match slot.latest.take() {
            Some(item) => item,
            None if slot.closed => Err(CaptureError::Unavailable),
            None => Err(CaptureError::Timeout(timeout)),
        }
    }
}

/// Detector child process plus its stdout reader
pub struct DetectorProcess {
    child: Child,
    handoff: Arc<Handoff>,
    timeout: Duration,
}

impl DetectorProcess {
    /// Start `command` for the given camera
    pub fn spawn(
        command: &[String],
        camera_index: u32,
        timeout: Duration,
    ) -> Result<Self, CaptureError> {
        let (program, args) = command.split_first().ok_or_else(|| CaptureError::Spawn {
            program: String::new(),
            message: "empty command".to_string(),
        })?;

        let mut child = Command::new(program)
            .args(args)
            .arg("--camera-index")
            .arg(camera_index.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| CaptureError::Spawn {
                program: program.clone(),
                message: e.to_string(),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| CaptureError::Spawn {
            program: program.clone(),
            message: "stdout not captured".to_string(),
        })?;

        let handoff = Arc::new(Handoff::default());
        let writer = Arc::clone(&handoff);
        thread::Builder::new()
            .name("detector-reader".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            warn!(?e, "detector stdout read failed");
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    writer.publish(parse_sample(&line));
                }
                writer.close();
                debug!("detector output closed");
            })
            .map_err(|e| CaptureError::Spawn {
                program: program.clone(),
                message: e.to_string(),
            })?;

        info!(%program, camera_index, "detector started");
        Ok(Self {
            child,
            handoff,
            timeout,
        })
    }
}

impl FrameSource for DetectorProcess {
    fn sample_frame(&mut self) -> Result<Sample, CaptureError> {
        self.handoff.take(self.timeout)
    }
}

impl Drop for DetectorProcess {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!(?e, "detector already exited");
        }
        let _ = self.child.wait();
    }
}

fn parse_sample(line: &str) -> Result<Sample, CaptureError> {
    let sample: Sample =
        serde_json::from_str(line).map_err(|e| CaptureError::Malformed(e.to_string()))?;
    if sample.face_present && sample.confidence.is_none() {
        return Err(CaptureError::Malformed("face without confidence".to_string()));
    }
    Ok(sample)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sample() {
        assert_eq!(
            parse_sample(r#"{"face_present": true, "confidence": 0.8}"#).unwrap(),
            Sample::face(0.8)
        );
        assert_eq!(
            parse_sample(r#"{"face_present": false}"#).unwrap(),
            Sample::no_face()
        );
        assert!(matches!(
            parse_sample(r#"{"face_present": true}"#),
            Err(CaptureError::Malformed(_))
        ));
        assert!(matches!(parse_sample("nope"), Err(CaptureError::Malformed(_))));
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(
            DetectorProcess::spawn(&[], 0, Duration::from_millis(10)),
            Err(CaptureError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    fn shell(script: &str) -> Vec<String> {
        // The trailing "sh" fills $0 so the appended camera flag lands in $1/$2
        vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "sh".to_string(),
        ]
    }

    #[cfg(unix)]
    #[test]
    fn test_reads_samples_then_reports_exit() {
        let command = shell(r#"echo "{\"face_present\": true, \"confidence\": 0.6}""#);
        let mut detector = DetectorProcess::spawn(&command, 0, Duration::from_secs(5)).unwrap();
        assert_eq!(detector.sample_frame().unwrap(), Sample::face(0.6));
        assert_eq!(detector.sample_frame(), Err(CaptureError::Unavailable));
    }

    #[cfg(unix)]
    #[test]
    fn test_camera_index_is_forwarded() {
        let command = shell(r#"echo "{\"face_present\": true, \"confidence\": 0.$2}""#);
        let mut detector = DetectorProcess::spawn(&command, 3, Duration::from_secs(5)).unwrap();
        assert_eq!(detector.sample_frame().unwrap(), Sample::face(0.3));
    }

    #[cfg(unix)]
    #[test]
    fn test_silent_detector_times_out() {
        let command = shell("sleep 2");
        let mut detector = DetectorProcess::spawn(&command, 0, Duration::from_millis(50)).unwrap();
        assert!(matches!(
            detector.sample_frame(),
            Err(CaptureError::Timeout(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_unsampled_output_keeps_only_newest() {
        let command = shell(
            r#"i=0
while [ $i -lt 2000 ]; do
  echo "{\"face_present\": true, \"confidence\": 0.1}"
  i=$((i+1))
done
echo "{\"face_present\": true, \"confidence\": 0.9}"
sleep 5"#,
        );
        let mut detector = DetectorProcess::spawn(&command, 0, Duration::from_millis(50)).unwrap();
        thread::sleep(Duration::from_millis(500));

        assert_eq!(detector.sample_frame().unwrap(), Sample::face(0.9));
        // Nothing older is queued behind it
        assert!(matches!(
            detector.sample_frame(),
            Err(CaptureError::Timeout(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_valid_sample_preferred_over_later_garbage() {
        let command = shell(
            r#"echo "{\"face_present\": true, \"confidence\": 0.4}"
echo "not json"
sleep 5"#,
        );
        let mut detector = DetectorProcess::spawn(&command, 0, Duration::from_millis(50)).unwrap();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(detector.sample_frame().unwrap(), Sample::face(0.4));
    }

    #[cfg(unix)]
    #[test]
    fn test_garbage_alone_is_reported() {
        let command = shell("echo garbage; sleep 5");
        let mut detector = DetectorProcess::spawn(&command, 0, Duration::from_secs(5)).unwrap();
        assert!(matches!(
            detector.sample_frame(),
            Err(CaptureError::Malformed(_))
        ));
    }
}
