//! Exponential moving average over raw confidence samples

use crate::config::ConfigError;

/// EMA filter; larger `beta` responds slower and rejects more noise
#[derive(Debug, Clone)]
pub struct Smoother {
    beta: f64,
    ema: Option<f64>,
}

impl Smoother {
    pub fn new(beta: f64) -> Result<Self, ConfigError> {
        if !(beta > 0.0 && beta < 1.0) {
            return Err(ConfigError::EmaBeta(beta));
        }
        Ok(Self { beta, ema: None })
    }

    /// Fold one sample into the average and return the new value
    ///
    /// Samples are clamped to [0, 1]. The first sample seeds the average.
    pub fn update(&mut self, raw: f64) -> f64 {
        let raw = clamp_unit(raw);
        let next = match self.ema {
            Some(ema) => self.beta * ema + (1.0 - self.beta) * raw,
            None => raw,
        };
        self.ema = Some(next);
        next
    }

    /// Restart the average at `value`, forgetting prior history
    pub fn reset(&mut self, value: f64) {
        self.ema = Some(clamp_unit(value));
    }

    /// Current average, if any sample has been seen
    pub fn value(&self) -> Option<f64> {
        self.ema
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
