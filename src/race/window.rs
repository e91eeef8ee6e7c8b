use std::{thread, time::Duration};

use indicatif::MultiProgress;
use serde::Serialize;

use crate::{
    timing::tsc,
    util::{make_progress, NARROW_WINDOW_CYCLES, WINDOW_MAX_SAMPLES, WINDOW_MIN_SAMPLES},
};

#[cfg(feature = "window_dump")]
const WINDOW_LOG: &str = "log/window.csv";

/// Duration profile of the race window, in cycles.
///
/// Fixed for the remainder of a run: `mean` is the timing target of every attempt and
/// `min`/`max` are its classification bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct WindowProfile {
    pub mean: u64,
    pub min: u64,
    pub max: u64,
    pub stddev: u64,
    pub sample_count: u32,
}

impl WindowProfile {
    /// Summarize `samples`. The standard deviation is the population one (divides by N).
    ///
    /// Returns `None` for an empty slice.
    pub fn from_samples(samples: &[u64]) -> Option<Self> {
        let n = samples.len() as u64;
        let min = *samples.iter().min()?;
        let max = *samples.iter().max()?;
        let mean = (samples.iter().map(|&s| s as u128).sum::<u128>() / n as u128) as u64;
        // a wrapped counter reading can sit near u64::MAX; its square still fits a u128
        let var = samples
            .iter()
            .map(|&s| {
                let d = s.abs_diff(mean) as u128;
                d * d
            })
            .fold(0u128, u128::saturating_add)
            / n as u128;
        Some(WindowProfile {
            mean,
            min,
            max,
            stddev: (var as f64).sqrt() as u64,
            sample_count: samples.len() as u32,
        })
    }

    pub fn is_narrow(&self) -> bool {
        self.mean < NARROW_WINDOW_CYCLES
    }
}

/// Clamp a requested sample count to the supported range.
pub fn clamp_samples(target_samples: u32) -> u32 {
    target_samples.clamp(WINDOW_MIN_SAMPLES, WINDOW_MAX_SAMPLES)
}

/// Profile the window by timing the operation the race targets: a minimal sleep, the
/// interval during which an in-flight translation stays valid.
pub fn estimate_window(target_samples: u32, progress: Option<&MultiProgress>) -> WindowProfile {
    estimate_window_with(target_samples, progress, || {
        thread::sleep(Duration::from_micros(1))
    })
}

/// Profile the window by timing `op` between serialized counter reads.
pub fn estimate_window_with<F: FnMut()>(
    target_samples: u32,
    progress: Option<&MultiProgress>,
    mut op: F,
) -> WindowProfile {
    let samples = clamp_samples(target_samples);
    info!("Estimating race window ({} samples)...", samples);
    let p = make_progress(progress, "window", samples as u64);
    let measurements = (0..samples)
        .map(|_| {
            let t = tsc::time(&mut op);
            if let Some(p) = p.as_ref() {
                p.inc(1);
            }
            t
        })
        .collect::<Vec<_>>();
    if let Some(p) = p {
        p.finish_and_clear();
    }
    #[cfg(feature = "window_dump")]
    dump_samples(&measurements);

    // `samples` is at least WINDOW_MIN_SAMPLES, so there is always data
    let profile = WindowProfile::from_samples(&measurements).unwrap_or(WindowProfile {
        mean: 0,
        min: 0,
        max: 0,
        stddev: 0,
        sample_count: 0,
    });
    info!(
        "Window profile: mean {} min {} max {} stddev {} cycles",
        profile.mean, profile.min, profile.max, profile.stddev
    );
    profile
}

#[cfg(feature = "window_dump")]
fn dump_samples(measurements: &[u64]) {
    use std::io::Write;
    let file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(WINDOW_LOG);
    match file {
        Ok(mut file) => {
            for (idx, m) in measurements.iter().enumerate() {
                if let Err(e) = writeln!(file, "{},{}", idx, m) {
                    warn!("Failed to write {}: {}", WINDOW_LOG, e);
                    break;
                }
            }
        }
        Err(e) => warn!("Failed to open {}: {}", WINDOW_LOG, e),
    }
}
