pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Back-to-back timestamp pairs used to estimate the measurement overhead.
pub const CALIBRATION_ROUNDS: usize = 10_000;
/// Timed loads per group (hit/miss) during threshold calibration.
pub const THRESHOLD_ROUNDS: usize = 1_000;
/// Fixed margin applied to the averaged hit/miss latencies.
pub const THRESHOLD_MARGIN: u64 = 20;

/// Flush/reload rounds of a single co-residency verification.
pub const CORESIDENCY_ROUNDS: usize = 10_000;
/// Hit rate a CPU pair must exceed to be considered LLC sharing.
pub const CORESIDENCY_HIT_RATE: f64 = 0.1;

pub const WINDOW_MIN_SAMPLES: u32 = 100;
pub const WINDOW_MAX_SAMPLES: u32 = 10_000;
/// Windows narrower than this are unlikely to be raceable.
pub const NARROW_WINDOW_CYCLES: u64 = 1_000;

pub const MAX_RING_SIZE: usize = 256;

pub const MIN_BOOTSTRAP_SAMPLES: usize = 10;
pub const DEFAULT_BOOTSTRAP_ROUNDS: u32 = 10_000;
pub const DEFAULT_ALPHA: f64 = 0.05;
pub const DEFAULT_NEGLIGIBLE_THRESHOLD: u64 = 50;

pub const POPULATION_CAPACITY: usize = 10_000;
