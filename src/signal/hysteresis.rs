//! Dual-threshold classification
//!
//! Which threshold applies depends on the current committed state, so scores
//! between the two thresholds always keep the current state.

use crate::config::ConfigError;
use crate::state::Engagement;

/// Threshold pair; `on` is always strictly above `off`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    on: f64,
    off: f64,
}

impl Thresholds {
    pub fn new(on: f64, off: f64) -> Result<Self, ConfigError> {
        if on <= off {
            return Err(ConfigError::ThresholdOrder { on, off });
        }
        Ok(Self { on, off })
    }
}

/// Map a smoothed score to an intent given the current state
pub fn classify(smoothed: f64, current: Engagement, thresholds: &Thresholds) -> Engagement {
    match current {
        Engagement::NotEngaged if smoothed >= thresholds.on => Engagement::Engaged,
        Engagement::Engaged if smoothed <= thresholds.off => Engagement::NotEngaged,
        _ => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use Engagement::{Engaged, NotEngaged};

    fn thresholds() -> Thresholds {
        Thresholds::new(0.55, 0.4).unwrap()
    }

    #[test]
    fn test_order_enforced() {
        assert!(Thresholds::new(0.4, 0.4).is_err());
        assert!(Thresholds::new(0.3, 0.4).is_err());
    }

    #[test]
    fn test_thresholds_are_inclusive() {
        let t = thresholds();
        assert_eq!(classify(0.55, NotEngaged, &t), Engaged);
        assert_eq!(classify(0.4, Engaged, &t), NotEngaged);
    }

    #[test]
    fn test_band_preserves_state() {
        let t = thresholds();
        for score in [0.41, 0.45, 0.5, 0.549] {
            assert_eq!(classify(score, Engaged, &t), Engaged);
            assert_eq!(classify(score, NotEngaged, &t), NotEngaged);
        }
    }

    #[test]
    fn test_extremes() {
        let t = thresholds();
        assert_eq!(classify(0.0, NotEngaged, &t), NotEngaged);
        assert_eq!(classify(1.0, Engaged, &t), Engaged);
        assert_eq!(classify(1.0, NotEngaged, &t), Engaged);
        assert_eq!(classify(0.0, Engaged, &t), NotEngaged);
    }
}
