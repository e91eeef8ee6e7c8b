use std::{fs::File, io::Read, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    stats::BootstrapConfig,
    util::{
        DEFAULT_ALPHA, DEFAULT_BOOTSTRAP_ROUNDS, DEFAULT_NEGLIGIBLE_THRESHOLD, MAX_RING_SIZE,
    },
};

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("alpha must be in (0, 1), got {0}")]
    InvalidAlpha(f64),
    #[error("iterations per campaign must be positive")]
    ZeroIterations,
    #[error("bootstrap rounds must be positive")]
    ZeroBootstrapRounds,
    #[error("window sample count must be positive")]
    ZeroWindowSamples,
    #[error("ring size must be in 1..=256, got {0}")]
    InvalidRingSize(usize),
}

/// Run configuration of the race fuzzer. Every field has a default, so a JSON file only
/// needs to name what it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzConfig {
    /// Binary scanned for race candidates.
    pub target_binary: String,
    pub campaigns: u32,
    pub iterations_per_campaign: u32,
    pub bootstrap_rounds: u32,
    pub alpha: f64,
    pub negligible_threshold_cycles: u64,
    pub window_samples: u32,
    pub ring_size: usize,
    /// CSV experiment log, appended to across runs.
    pub output: String,
    /// RNG seed; a random one is drawn (and reported) when absent.
    pub seed: Option<u64>,
    pub scan_only: bool,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        FuzzConfig {
            target_binary: "/usr/bin/ls".to_string(),
            campaigns: 1,
            iterations_per_campaign: 10_000,
            bootstrap_rounds: DEFAULT_BOOTSTRAP_ROUNDS,
            alpha: DEFAULT_ALPHA,
            negligible_threshold_cycles: DEFAULT_NEGLIGIBLE_THRESHOLD,
            window_samples: 1000,
            ring_size: MAX_RING_SIZE,
            output: "lvi-dma-results.csv".to_string(),
            seed: None,
            scan_only: false,
        }
    }
}

impl FuzzConfig {
    pub fn from_jsonfile<P: AsRef<Path>>(filepath: P) -> anyhow::Result<FuzzConfig> {
        let filepath = filepath.as_ref();
        let mut file = File::open(filepath)
            .with_context(|| format!("open config {}", filepath.display()))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: FuzzConfig = serde_json::from_str(&contents)
            .with_context(|| format!("parse config {}", filepath.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(ConfigError::InvalidAlpha(self.alpha));
        }
        if self.iterations_per_campaign == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if self.bootstrap_rounds == 0 {
            return Err(ConfigError::ZeroBootstrapRounds);
        }
        if self.window_samples == 0 {
            return Err(ConfigError::ZeroWindowSamples);
        }
        if self.ring_size == 0 || self.ring_size > MAX_RING_SIZE {
            return Err(ConfigError::InvalidRingSize(self.ring_size));
        }
        Ok(())
    }

    pub fn bootstrap(&self) -> BootstrapConfig {
        BootstrapConfig {
            rounds: self.bootstrap_rounds,
            alpha: self.alpha,
            negligible_threshold_cycles: self.negligible_threshold_cycles,
        }
    }

    pub fn log(&self) {
        info!("Configuration:");
        info!("    Target binary:        {}", self.target_binary);
        info!("    Campaigns:            {}", self.campaigns);
        info!("    Iterations/campaign:  {}", self.iterations_per_campaign);
        info!("    Bootstrap rounds:     {}", self.bootstrap_rounds);
        info!("    Alpha:                {:.4}", self.alpha);
        info!(
            "    Negligible threshold: {} cycles",
            self.negligible_threshold_cycles
        );
        info!("    Window samples:       {}", self.window_samples);
        info!("    Ring size:            {}", self.ring_size);
        info!("    Output log:           {}", self.output);
        info!("    Scan only:            {}", self.scan_only);
    }
}
