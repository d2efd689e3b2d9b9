//! Perception module: smile confidence samples from an external detector

mod detector;

pub use detector::{CaptureError, DetectorProcess, FrameSource, Sample};
