use indicatif::MultiProgress;
use rand::{Rng as _, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::{
    make_progress, DEFAULT_ALPHA, DEFAULT_BOOTSTRAP_ROUNDS, DEFAULT_NEGLIGIBLE_THRESHOLD,
    MIN_BOOTSTRAP_SAMPLES,
};

use super::population::{median_in_place, Population};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub rounds: u32,
    pub alpha: f64,
    pub negligible_threshold_cycles: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            rounds: DEFAULT_BOOTSTRAP_ROUNDS,
            alpha: DEFAULT_ALPHA,
            negligible_threshold_cycles: DEFAULT_NEGLIGIBLE_THRESHOLD,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum BootstrapError {
    #[error("Insufficient data: {leak} leak / {no_leak} no-leak samples (need {MIN_BOOTSTRAP_SAMPLES} each)")]
    InsufficientSamples { leak: usize, no_leak: usize },
    #[error("Bootstrap needs at least one round")]
    ZeroRounds,
    #[error("Alpha {0} outside (0, 1)")]
    InvalidAlpha(f64),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BootstrapResult {
    /// Observed `median(leak) - median(no_leak)`.
    pub median_diff: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub p_value: f64,
    pub is_significant: bool,
    pub exceeds_threshold: bool,
    pub rounds: u32,
}

impl BootstrapResult {
    /// Significant at the configured alpha and larger than the negligible threshold.
    pub fn is_exploitable(&self) -> bool {
        self.is_significant && self.exceeds_threshold
    }
}

/// Indices of the `(1 - alpha)` confidence bounds in `rounds` sorted differences.
pub fn ci_indices(alpha: f64, rounds: u32) -> (usize, usize) {
    let last = rounds.saturating_sub(1) as usize;
    let lower = (alpha / 2.0 * rounds as f64) as usize;
    let upper = ((1.0 - alpha / 2.0) * rounds as f64) as usize;
    (lower.min(last), upper.min(last))
}

/// Draw `out.len()` samples from `data` with replacement.
fn resample<R: RngCore>(data: &[u64], out: &mut [u64], rng: &mut R) {
    for slot in out.iter_mut() {
        *slot = data[rng.gen_range(0..data.len())];
    }
}

/// Bootstrap test of the median latency difference between `leak` and `no_leak`.
///
/// Each round resamples both populations with replacement at their own size and records
/// the difference of the resampled medians. The confidence interval is read off the
/// sorted differences at `alpha/2` and `1 - alpha/2`.
///
/// The p-value is the fraction of resampled differences whose magnitude reaches the
/// observed one. It is measured against the spread of the resampled differences
/// themselves, not against a null distribution centered at zero. This is a known
/// deviation from a textbook bootstrap test and is kept so verdicts stay comparable
/// with earlier campaigns.
///
/// The whole pass runs to completion once started; there is no cancellation point inside.
pub fn bootstrap_test<R: RngCore>(
    leak: &Population,
    no_leak: &Population,
    config: &BootstrapConfig,
    rng: &mut R,
    progress: Option<&MultiProgress>,
) -> Result<BootstrapResult, BootstrapError> {
    if leak.len() < MIN_BOOTSTRAP_SAMPLES || no_leak.len() < MIN_BOOTSTRAP_SAMPLES {
        return Err(BootstrapError::InsufficientSamples {
            leak: leak.len(),
            no_leak: no_leak.len(),
        });
    }
    if config.rounds == 0 {
        return Err(BootstrapError::ZeroRounds);
    }
    if !(config.alpha > 0.0 && config.alpha < 1.0) {
        return Err(BootstrapError::InvalidAlpha(config.alpha));
    }
    info!("Running bootstrap test ({} rounds)...", config.rounds);

    let observed_diff = leak.median() as f64 - no_leak.median() as f64;

    let p = make_progress(progress, "bootstrap", config.rounds as u64);
    let mut leak_buf = vec![0u64; leak.len()];
    let mut no_leak_buf = vec![0u64; no_leak.len()];
    let mut diffs = Vec::with_capacity(config.rounds as usize);
    for round in 0..config.rounds {
        resample(leak.as_slice(), &mut leak_buf, rng);
        resample(no_leak.as_slice(), &mut no_leak_buf, rng);
        let diff = median_in_place(&mut leak_buf) as f64 - median_in_place(&mut no_leak_buf) as f64;
        diffs.push(diff);
        if round % 1000 == 0 {
            if let Some(p) = p.as_ref() {
                p.set_position(round as u64);
            }
        }
    }
    if let Some(p) = p {
        p.finish_and_clear();
    }

    diffs.sort_unstable_by(f64::total_cmp);
    let (lower_idx, upper_idx) = ci_indices(config.alpha, config.rounds);

    let extreme = diffs
        .iter()
        .filter(|d| d.abs() >= observed_diff.abs())
        .count();
    let p_value = extreme as f64 / config.rounds as f64;

    let result = BootstrapResult {
        median_diff: observed_diff,
        ci_lower: diffs[lower_idx],
        ci_upper: diffs[upper_idx],
        p_value,
        is_significant: p_value < config.alpha,
        exceeds_threshold: observed_diff.abs() > config.negligible_threshold_cycles as f64,
        rounds: config.rounds,
    };
    info!(
        "Bootstrap: median diff {:.2} cycles, {:.0}% CI [{:.2}, {:.2}], p-value {:.6}, significant: {}, exceeds threshold: {}",
        result.median_diff,
        (1.0 - config.alpha) * 100.0,
        result.ci_lower,
        result.ci_upper,
        result.p_value,
        result.is_significant,
        result.exceeds_threshold
    );
    Ok(result)
}
