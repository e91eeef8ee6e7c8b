use std::ptr;

use serde::Serialize;

use crate::util::{CALIBRATION_ROUNDS, THRESHOLD_MARGIN, THRESHOLD_ROUNDS};

use super::tsc;

/// Measurement overhead and cache classification thresholds, in cycles.
///
/// Built once at startup and never updated. Calibration cannot fail: readings from a
/// noisy machine are accepted as they are and the statistics later absorb the noise.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct CalibrationProfile {
    pub overhead: u64,
    pub hit_threshold: u64,
    pub miss_threshold: u64,
}

impl CalibrationProfile {
    /// Calibrate on the current CPU.
    pub fn calibrate() -> Self {
        info!("Calibrating timing overhead...");
        let overhead = (0..CALIBRATION_ROUNDS)
            .map(|_| tsc::measure_empty())
            .sum::<u64>()
            / CALIBRATION_ROUNDS as u64;
        info!("Timing overhead: {} cycles", overhead);

        // one cache line on the heap; clflush works on any mapped address
        let line = vec![0u64; 8];
        let addr = line.as_ptr();

        let hits: Vec<u64> = (0..THRESHOLD_ROUNDS)
            .map(|_| {
                tsc::time(|| unsafe {
                    ptr::read_volatile(addr);
                })
            })
            .collect();
        let misses: Vec<u64> = (0..THRESHOLD_ROUNDS)
            .map(|_| {
                unsafe { tsc::flush(addr as *const u8) };
                tsc::time(|| unsafe {
                    ptr::read_volatile(addr);
                })
            })
            .collect();
        trace!("Hit measurements: {:?}", hits);
        trace!("Miss measurements: {:?}", misses);

        let profile = Self::from_measurements(overhead, &hits, &misses);
        info!("Cache hit threshold: {} cycles", profile.hit_threshold);
        info!("Cache miss threshold: {} cycles", profile.miss_threshold);
        if profile.hit_threshold >= profile.miss_threshold {
            warn!("Hit and miss thresholds overlap, timing is very noisy on this machine");
        }
        profile
    }

    /// Average raw hit/miss readings with the overhead subtracted from each and derive
    /// the thresholds. Empty groups average to 0.
    pub fn from_measurements(overhead: u64, hits: &[u64], misses: &[u64]) -> Self {
        let corrected_avg = |raw: &[u64]| {
            if raw.is_empty() {
                return 0;
            }
            let sum = raw
                .iter()
                .map(|&t| t.saturating_sub(overhead) as u128)
                .sum::<u128>();
            (sum / raw.len() as u128) as u64
        };
        Self::from_averages(overhead, corrected_avg(hits), corrected_avg(misses))
    }

    /// Derive thresholds from averaged hit/miss latencies using the fixed margin.
    pub fn from_averages(overhead: u64, avg_hit: u64, avg_miss: u64) -> Self {
        CalibrationProfile {
            overhead,
            hit_threshold: avg_hit.saturating_add(THRESHOLD_MARGIN),
            miss_threshold: avg_miss.saturating_sub(THRESHOLD_MARGIN),
        }
    }
}
