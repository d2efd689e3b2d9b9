//! Interactive threshold calibration
//!
//! Averages the detector's confidence over a neutral face and a smile, then
//! places the hysteresis thresholds inside that range with a 15% margin on
//! each side.

use std::io::{BufRead, Write};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::perception::{CaptureError, FrameSource};

/// Samples captured per phase (5 s at ~20 Hz)
pub const PHASE_SAMPLES: usize = 100;

/// Pause between calibration samples
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

/// Fraction of the neutral-to-smile distance kept between each threshold and its average
const MARGIN_FRACTION: f64 = 0.15;

/// Errors that abort calibration
#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("no face detected during the {0} phase")]
    NoFace(&'static str),

    #[error("smile ({smiling:.3}) is not distinguishable from neutral ({neutral:.3})")]
    NotSeparable { neutral: f64, smiling: f64 },

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("terminal I/O failed: {0}")]
    Prompt(#[from] std::io::Error),
}

/// Averages and the thresholds derived from them
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationResult {
    pub neutral: f64,
    pub smiling: f64,
    pub on: f64,
    pub off: f64,
}

/// Derive thresholds from the two phase averages
pub fn thresholds_from_averages(
    neutral: f64,
    smiling: f64,
) -> Result<CalibrationResult, CalibrationError> {
    let margin = (smiling - neutral) * MARGIN_FRACTION;
    let off = neutral + margin;
    let on = smiling - margin;
    if on <= off {
        return Err(CalibrationError::NotSeparable { neutral, smiling });
    }
    Ok(CalibrationResult {
        neutral,
        smiling,
        on,
        off,
    })
}

/// Average face-present confidences over `samples` frames
///
/// Frames without a face and transient timeouts are skipped; a detector that
/// has gone away aborts the phase.
pub fn capture_average<S: FrameSource>(
    source: &mut S,
    samples: usize,
    interval: Duration,
    phase: &'static str,
) -> Result<f64, CalibrationError> {
    let mut sum = 0.0;
    let mut count = 0usize;

    for _ in 0..samples {
        match source.sample_frame() {
            Ok(sample) => {
                if let (true, Some(confidence)) = (sample.face_present, sample.confidence) {
                    sum += confidence.clamp(0.0, 1.0);
                    count += 1;
                }
            }
            Err(CaptureError::Timeout(d)) => debug!(?d, phase, "calibration frame timed out"),
            Err(CaptureError::Malformed(m)) => warn!(%m, phase, "skipping malformed frame"),
            Err(e) => return Err(e.into()),
        }
        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }

    if count == 0 {
        return Err(CalibrationError::NoFace(phase));
    }
    Ok(sum / count as f64)
}

/// Walk the user through both phases
pub fn run<S, R, W>(
    source: &mut S,
    input: &mut R,
    output: &mut W,
    samples: usize,
    interval: Duration,
) -> Result<CalibrationResult, CalibrationError>
where
    S: FrameSource,
    R: BufRead,
    W: Write,
{
    writeln!(output, "\n=== Smile Detection Calibration ===\n")?;

    let neutral = phase(
        source,
        input,
        output,
        samples,
        interval,
        "neutral",
        "Keep a NEUTRAL expression (no smile)",
    )?;
    let smiling = phase(
        source,
        input,
        output,
        samples,
        interval,
        "smiling",
        "Now SMILE naturally",
    )?;

    let result = thresholds_from_averages(neutral, smiling)?;
    writeln!(output, "\nCalibration complete")?;
    writeln!(output, "  Neutral:       {:.3}", result.neutral)?;
    writeln!(output, "  Smiling:       {:.3}", result.smiling)?;
    writeln!(output, "  Threshold OFF: {:.3}", result.off)?;
    writeln!(output, "  Threshold ON:  {:.3}", result.on)?;
    Ok(result)
}

fn phase<S, R, W>(
    source: &mut S,
    input: &mut R,
    output: &mut W,
    samples: usize,
    interval: Duration,
    name: &'static str,
    instruction: &str,
) -> Result<f64, CalibrationError>
where
    S: FrameSource,
    R: BufRead,
    W: Write,
{
    writeln!(output, "{instruction}")?;
    write!(output, "  Press Enter when ready...")?;
    output.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;

    let average = capture_average(source, samples, interval, name)?;
    writeln!(output, "  Average score: {average:.3}")?;
    Ok(average)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    use crate::engine::ScriptedSource;
    use crate::perception::Sample;

    #[test]
    fn test_thresholds_from_averages() {
        let result = thresholds_from_averages(0.1, 0.9).unwrap();
        assert!((result.off - 0.22).abs() < 1e-9);
        assert!((result.on - 0.78).abs() < 1e-9);
    }

    #[test]
    fn test_inverted_averages_rejected() {
        assert!(matches!(
            thresholds_from_averages(0.6, 0.5),
            Err(CalibrationError::NotSeparable { .. })
        ));
        assert!(thresholds_from_averages(0.5, 0.5).is_err());
    }

    #[test]
    fn test_capture_average_skips_missing_faces() {
        let mut source = ScriptedSource::repeating(Sample::no_face());
        source.queue.extend([
            Ok(Sample::face(0.2)),
            Ok(Sample::no_face()),
            Err(CaptureError::Timeout(Duration::from_millis(1))),
            Ok(Sample::face(0.4)),
        ]);
        let avg = capture_average(&mut source, 4, Duration::ZERO, "neutral").unwrap();
        assert!((avg - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_capture_without_face_fails() {
        let mut source = ScriptedSource::repeating(Sample::no_face());
        assert!(matches!(
            capture_average(&mut source, 5, Duration::ZERO, "smiling"),
            Err(CalibrationError::NoFace("smiling"))
        ));
    }

    #[test]
    fn test_detector_loss_aborts() {
        let mut source = ScriptedSource::repeating(Sample::no_face());
        source.fallback = Err(CaptureError::Unavailable);
        assert!(matches!(
            capture_average(&mut source, 5, Duration::ZERO, "neutral"),
            Err(CalibrationError::Capture(CaptureError::Unavailable))
        ));
    }

    #[test]
    fn test_full_wizard() {
        let mut source = ScriptedSource::repeating(Sample::no_face());
        source.queue.extend((0..10).map(|_| Ok(Sample::face(0.1))));
        source.queue.extend((0..10).map(|_| Ok(Sample::face(0.9))));

        let mut input = Cursor::new("\n\n");
        let mut output = Vec::new();
        let result = run(&mut source, &mut input, &mut output, 10, Duration::ZERO).unwrap();

        assert!((result.neutral - 0.1).abs() < 1e-9);
        assert!((result.smiling - 0.9).abs() < 1e-9);
        assert!(result.on > result.off);
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("Threshold ON"));
    }
}
