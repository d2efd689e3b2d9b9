//! Engagement state module
//!
//! Provides the two-valued engagement type and the debounced state machine
//! that owns the authoritative state:
//! - NotEngaged: audio muted
//! - Engaged: audio restored to the remembered level

mod machine;

pub use machine::{DebounceMachine, Engagement, Transition};
