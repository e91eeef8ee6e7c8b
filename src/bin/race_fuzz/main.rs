use std::process;

use anyhow::bail;
use clap::Parser;
use iotlb_race::{
    campaign::{run_campaigns, CampaignContext},
    config::FuzzConfig,
    experiment::{summary_filename, ExperimentLog, RunSummary},
    gadget::scan_binary,
    race::{estimate_window, RaceEngine},
    timing::{construct_line_probe, CalibrationProfile},
    topology::{CoresidencyVerifier, CpuTopology},
    util::{init_logging_with_progress, CancelToken, Rng},
};
use log::{info, warn};

const EXIT_EXPLOITABLE: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_NOT_EXPLOITABLE: i32 = 2;

/// Race an in-flight descriptor address swap against a load and test the resulting
/// reload latencies for an exploitable leak.
///
/// Flags override the values of `--config`.
#[derive(Debug, Parser)]
struct CliArgs {
    /// JSON run configuration.
    #[clap(long = "config")]
    config: Option<String>,
    /// Binary to scan for race candidates.
    #[clap(short = 'b', long = "binary")]
    binary: Option<String>,
    /// Number of campaigns.
    #[clap(short = 'c', long = "campaigns")]
    campaigns: Option<u32>,
    /// Race attempts per campaign.
    #[clap(short = 'i', long = "iterations")]
    iterations: Option<u32>,
    /// Bootstrap resampling rounds.
    #[clap(long = "bootstrap")]
    bootstrap: Option<u32>,
    /// Significance level.
    #[clap(short = 'a', long = "alpha")]
    alpha: Option<f64>,
    /// Median differences at or below this many cycles are negligible.
    #[clap(short = 't', long = "threshold")]
    threshold: Option<u64>,
    /// CSV experiment log.
    #[clap(short = 'o', long = "output")]
    output: Option<String>,
    /// RNG seed for candidate choice and resampling.
    #[clap(long = "seed")]
    seed: Option<u64>,
    /// Samples for the window estimate.
    #[clap(long = "window-samples")]
    window_samples: Option<u32>,
    /// Only scan for candidates, don't race.
    #[clap(short = 's', long = "scan-only")]
    scan_only: bool,
}

impl CliArgs {
    fn into_config(self) -> anyhow::Result<FuzzConfig> {
        let mut config = match &self.config {
            Some(path) => FuzzConfig::from_jsonfile(path)?,
            None => FuzzConfig::default(),
        };
        if let Some(binary) = self.binary {
            config.target_binary = binary;
        }
        if let Some(campaigns) = self.campaigns {
            config.campaigns = campaigns;
        }
        if let Some(iterations) = self.iterations {
            config.iterations_per_campaign = iterations;
        }
        if let Some(rounds) = self.bootstrap {
            config.bootstrap_rounds = rounds;
        }
        if let Some(alpha) = self.alpha {
            config.alpha = alpha;
        }
        if let Some(threshold) = self.threshold {
            config.negligible_threshold_cycles = threshold;
        }
        if let Some(output) = self.output {
            config.output = output;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if let Some(samples) = self.window_samples {
            config.window_samples = samples;
        }
        config.scan_only |= self.scan_only;
        config.validate()?;
        Ok(config)
    }
}

/// Returns whether any campaign found an exploitable leak, or `None` for a scan-only run.
fn run(config: FuzzConfig) -> anyhow::Result<Option<bool>> {
    let progress = init_logging_with_progress()?;
    config.log();

    let cancel = CancelToken::new();
    cancel.install_signal_handler()?;

    let topology = CpuTopology::detect();
    topology.log();

    let calibration = CalibrationProfile::calibrate();

    info!("Verifying co-residency...");
    let verifier = CoresidencyVerifier::new(&topology, calibration, construct_line_probe());
    let Some(coresidency) = verifier.scan_for_coresident_pair()? else {
        bail!("No co-resident CPUs detected, the race needs a shared LLC");
    };

    let scan = scan_binary(&config.target_binary)?;
    scan.log_summary();
    if config.scan_only {
        info!("Scan-only mode: exiting");
        return Ok(None);
    }

    let window = estimate_window(config.window_samples, Some(&progress));
    if window.is_narrow() {
        warn!(
            "Race window is very narrow ({} cycles), the race may be impossible to win",
            window.mean
        );
        warn!("Consider a target with asynchronous translation invalidation");
    }

    let mut log = ExperimentLog::open(&config.output)?;
    let mut rng = config.seed.map_or_else(Rng::from_entropy, Rng::from_seed);
    let seed = rng.seed();
    info!("Seed: {}", seed);

    let engine = RaceEngine::new(window, calibration);
    let ctx = CampaignContext {
        engine: &engine,
        gadgets: &scan.gadgets,
    };
    let reports = run_campaigns(&ctx, &config, &mut rng, &mut log, &cancel, Some(&progress));

    let exploitable = reports.iter().any(|r| r.is_exploitable());
    let summary = RunSummary {
        date: chrono::Local::now().to_rfc3339(),
        seed,
        config: &config,
        calibration,
        coresidency: &coresidency,
        binary_sha256: &scan.sha256,
        candidates: scan.len(),
        window,
        campaigns: &reports,
        exploitable,
    };
    if let Err(e) = summary.write_json(summary_filename()) {
        warn!("Failed to write run summary: {:?}", e);
    }

    if exploitable {
        info!("RESULT: exploitable leak detected");
        info!("Results saved to: {}", log.path().display());
    } else {
        info!("RESULT: no exploitable leak found");
        info!("Data logged to: {}", log.path().display());
    }
    Ok(Some(exploitable))
}

fn main() {
    let args = CliArgs::parse();
    let code = match args.into_config().and_then(run) {
        Ok(None) | Ok(Some(true)) => EXIT_EXPLOITABLE,
        Ok(Some(false)) => EXIT_NOT_EXPLOITABLE,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            EXIT_ERROR
        }
    };
    process::exit(code);
}
