//! # Race
//! The time-of-check/time-of-use race against a device descriptor.
//!
//! - `descriptor`: the fixed-capacity descriptor ring the race mutates.
//! - `window`: statistical profile of the vulnerable window (timing target and bounds).
//! - `engine`: the per-attempt state machine
//!   `INIT -> ARMED -> WAIT -> SWAP -> LOAD -> PROBE -> CLASSIFIED`.
pub mod descriptor;
mod engine;
mod window;

pub use self::descriptor::{Descriptor, DescriptorRing, RingError};
pub use self::engine::{classify, RaceAttempt, RaceEngine, RaceOutcome};
pub use self::window::{clamp_samples, estimate_window, estimate_window_with, WindowProfile};
