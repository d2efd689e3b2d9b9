//! Signal conditioning for the raw smile confidence stream

mod hysteresis;
mod smoother;

pub use hysteresis::{classify, Thresholds};
pub use smoother::Smoother;
