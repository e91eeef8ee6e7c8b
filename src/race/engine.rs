use std::{fmt, ptr};

use serde::Serialize;

use crate::timing::{tsc, CalibrationProfile};

use super::{DescriptorRing, WindowProfile};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RaceOutcome {
    Success,
    TooEarly,
    TooLate,
    Failed,
}

impl fmt::Display for RaceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RaceOutcome::Success => write!(f, "SUCCESS"),
            RaceOutcome::TooEarly => write!(f, "TOO_EARLY"),
            RaceOutcome::TooLate => write!(f, "TOO_LATE"),
            RaceOutcome::Failed => write!(f, "FAILED"),
        }
    }
}

/// One classified race attempt. Timestamps are raw counter values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RaceAttempt {
    pub t_trigger: u64,
    pub t_swap: u64,
    pub t_load: u64,
    pub t_probe: u64,
    pub outcome: RaceOutcome,
    pub leak_detected: bool,
    /// Reload latency of the probe line. Recorded for every outcome, since it is the
    /// sample fed to one of the two populations.
    pub leak_latency: u64,
    /// Cycles between trigger and load.
    pub window_estimate: u64,
}

/// Classify an attempt from its probe reload latency and its trigger-to-load delta.
///
/// A fast probe reload is a leak regardless of where the load landed in the window.
pub fn classify(
    probe_latency: u64,
    window_estimate: u64,
    window: &WindowProfile,
    hit_threshold: u64,
) -> RaceOutcome {
    if probe_latency < hit_threshold {
        RaceOutcome::Success
    } else if window_estimate < window.min {
        RaceOutcome::TooEarly
    } else if window_estimate > window.max {
        RaceOutcome::TooLate
    } else {
        RaceOutcome::Failed
    }
}

/// Executes single race attempts against a descriptor ring.
///
/// An attempt runs to completion on the calling thread. Ordering between the swap, the
/// load and concurrent device activity relies only on full fences, no locks are taken.
pub struct RaceEngine {
    window: WindowProfile,
    calibration: CalibrationProfile,
}

impl RaceEngine {
    pub fn new(window: WindowProfile, calibration: CalibrationProfile) -> Self {
        Self {
            window,
            calibration,
        }
    }

    pub fn window(&self) -> &WindowProfile {
        &self.window
    }

    /// Run one attempt: arm `probe_line`, wait for the window midpoint, redirect descriptor
    /// `idx` to `target`, load through it and time the probe reload.
    ///
    /// # Safety
    /// `target` and `probe_line` must be valid for 8-byte reads, and `idx` must name a
    /// prepared descriptor of `ring`.
    pub unsafe fn execute(
        &self,
        ring: &DescriptorRing,
        idx: u16,
        target: *const u8,
        probe_line: *const u8,
    ) -> RaceAttempt {
        // INIT -> ARMED
        tsc::flush(probe_line);
        tsc::mfence();

        // ARMED -> WAIT
        let t_trigger = tsc::timing_start();
        let swap_at = t_trigger.wrapping_add(self.window.mean / 2);

        // WAIT -> SWAP
        while tsc::timing_start() < swap_at {
            std::hint::spin_loop();
        }

        // SWAP -> LOAD
        let t_swap = tsc::timing_start();
        ring.swap_address(idx, target as u64);
        tsc::mfence();

        // LOAD -> PROBE
        let addr = ring.descriptor(idx).addr() as *const u64;
        ptr::read_volatile(addr);
        tsc::mfence();
        let t_load = tsc::timing_start();

        // PROBE -> CLASSIFIED
        let t_probe = tsc::timing_start();
        let probe_latency = tsc::probe_time(probe_line);
        let window_estimate = t_load.wrapping_sub(t_trigger);
        let outcome = classify(
            probe_latency,
            window_estimate,
            &self.window,
            self.calibration.hit_threshold,
        );

        RaceAttempt {
            t_trigger,
            t_swap,
            t_load,
            t_probe,
            outcome,
            leak_detected: outcome == RaceOutcome::Success,
            leak_latency: probe_latency,
            window_estimate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BytePointer, MemBlock};

    fn window() -> WindowProfile {
        WindowProfile {
            mean: 2000,
            min: 1500,
            max: 2500,
            stddev: 100,
            sample_count: 1000,
        }
    }

    #[test]
    fn test_slow_probe_before_window_is_too_early() {
        assert_eq!(classify(200, 1000, &window(), 80), RaceOutcome::TooEarly);
    }

    #[test]
    fn test_fast_probe_inside_window_is_success() {
        assert_eq!(classify(50, 2000, &window(), 80), RaceOutcome::Success);
    }

    #[test]
    fn test_fast_probe_wins_regardless_of_window() {
        for delta in [0, 1000, 2000, 3000, u64::MAX] {
            assert_eq!(classify(79, delta, &window(), 80), RaceOutcome::Success);
        }
    }

    #[test]
    fn test_late_and_failed() {
        assert_eq!(classify(200, 2501, &window(), 80), RaceOutcome::TooLate);
        assert_eq!(classify(200, 2500, &window(), 80), RaceOutcome::Failed);
        assert_eq!(classify(200, 1500, &window(), 80), RaceOutcome::Failed);
        assert_eq!(classify(80, 2000, &window(), 80), RaceOutcome::Failed);
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(RaceOutcome::TooEarly.to_string(), "TOO_EARLY");
        assert_eq!(
            serde_json::to_string(&RaceOutcome::TooLate).unwrap(),
            "\"TOO_LATE\""
        );
    }

    #[test]
    fn test_execute_swaps_and_orders_timestamps() -> anyhow::Result<()> {
        let target = MemBlock::mmap(4096, 0xAA)?;
        let probe = MemBlock::page()?;
        let mut ring = DescriptorRing::new(4)?;
        let idx = ring.prepare(probe.ptr() as u64).unwrap();
        let engine = RaceEngine::new(window(), CalibrationProfile::from_averages(0, 0, 300));
        let attempt = unsafe { engine.execute(&ring, idx, target.ptr(), probe.ptr()) };
        assert_eq!(ring.descriptor(idx).addr(), target.ptr() as u64);
        assert!(attempt.t_trigger <= attempt.t_swap);
        assert!(attempt.t_swap <= attempt.t_load);
        assert!(attempt.t_load <= attempt.t_probe);
        assert!(attempt.window_estimate >= window().mean / 2);
        assert_eq!(
            attempt.leak_detected,
            attempt.outcome == RaceOutcome::Success
        );
        assert_eq!(attempt.leak_latency >= 20, !attempt.leak_detected);
        Ok(())
    }
}
