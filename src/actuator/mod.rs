//! Actuator module: system output volume and the controller that drives it

mod controller;
mod volume;

pub use controller::{ActuatorController, CommandOutcome};
pub use volume::{CommandError, OsaScriptVolume, VolumeControl};

#[cfg(test)]
pub(crate) use controller::tests::FakeVolume;
