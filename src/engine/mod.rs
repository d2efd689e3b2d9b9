//! Engine module: the detection pipeline and the loop that drives it

mod pipeline;
mod runner;

pub use pipeline::{Engine, Snapshot};
pub use runner::{EngineControl, EngineRunner};

#[cfg(test)]
pub(crate) use pipeline::tests::ScriptedSource;
