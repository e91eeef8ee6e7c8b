//! Cycle-accurate timing primitives.
//!
//! - `tsc`: serialized timestamp counter reads and cache line eviction.
//! - `CalibrationProfile`: per-machine measurement overhead and hit/miss thresholds.
//! - `LineProbe`: the flush+reload primitive, behind a trait so the co-residency logic can
//!   be driven by synthetic probes.
mod calibration;
mod probe;
pub mod tsc;

pub use self::calibration::CalibrationProfile;
pub use self::probe::{classify, construct_line_probe, CacheResult, LineProbe, TscProbe};
