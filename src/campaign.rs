//! Fuzzing campaigns: repeated race attempts against randomly chosen candidates, followed
//! by the significance test over the collected latencies.
use anyhow::bail;
use indicatif::{MultiProgress, ProgressBar};
use serde::Serialize;

use crate::{
    config::FuzzConfig,
    experiment::{ExperimentLog, ExperimentRecord},
    gadget::Gadget,
    memory::{BytePointer, MemBlock},
    race::{DescriptorRing, RaceAttempt, RaceEngine},
    stats::{bootstrap_test, BootstrapResult, Population},
    util::{make_progress, CancelToken, Rng, PAGE_SIZE, POPULATION_CAPACITY},
};

/// Bytes the simulated device reports as written when it retires a descriptor.
const COMPLETED_LEN: u32 = 8;
const PROGRESS_UPDATE: u64 = 1000;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CampaignStats {
    /// Creation time in unix milliseconds.
    pub campaign_id: u64,
    pub name: String,
    pub total_attempts: u64,
    pub successful_leaks: u64,
    /// Iterations dropped because every descriptor was in flight.
    pub skipped: u64,
    pub success_rate: f64,
}

impl CampaignStats {
    pub fn new(name: &str) -> Self {
        CampaignStats {
            campaign_id: chrono::Utc::now().timestamp_millis() as u64,
            name: name.to_string(),
            total_attempts: 0,
            successful_leaks: 0,
            skipped: 0,
            success_rate: 0.0,
        }
    }

    fn record(&mut self, leak_detected: bool) {
        self.total_attempts += 1;
        if leak_detected {
            self.successful_leaks += 1;
        }
        self.success_rate = self.successful_leaks as f64 / self.total_attempts as f64;
    }
}

/// Outcome of a finished campaign.
#[derive(Clone, Debug, Serialize)]
pub struct CampaignReport {
    pub stats: CampaignStats,
    pub leak_samples: usize,
    pub no_leak_samples: usize,
    pub leak_outliers: usize,
    pub no_leak_outliers: usize,
    pub bootstrap: Option<BootstrapResult>,
    /// Why no verdict was reached, if the significance test did not run.
    pub no_verdict: Option<String>,
    pub cancelled: bool,
}

impl CampaignReport {
    /// Report of a campaign that could not run to the end.
    pub fn failed(name: &str, error: &anyhow::Error) -> Self {
        CampaignReport {
            stats: CampaignStats::new(name),
            leak_samples: 0,
            no_leak_samples: 0,
            leak_outliers: 0,
            no_leak_outliers: 0,
            bootstrap: None,
            no_verdict: Some(format!("campaign failed: {:#}", error)),
            cancelled: false,
        }
    }

    pub fn is_exploitable(&self) -> bool {
        self.bootstrap.map_or(false, |b| b.is_exploitable())
    }
}

/// Candidates and engine shared by every campaign of a run.
pub struct CampaignContext<'a> {
    pub engine: &'a RaceEngine,
    pub gadgets: &'a [Gadget],
}

/// State of a single campaign: the ring, the probe and target pages and the two
/// latency populations.
pub struct Campaign {
    stats: CampaignStats,
    ring: DescriptorRing,
    probe: MemBlock,
    target: MemBlock,
    leak: Population,
    no_leak: Population,
}

impl Campaign {
    pub fn new(name: &str, ring_size: usize) -> anyhow::Result<Self> {
        let campaign = Campaign {
            stats: CampaignStats::new(name),
            ring: DescriptorRing::new(ring_size)?,
            probe: MemBlock::mmap(PAGE_SIZE, 0x00)?,
            target: MemBlock::mmap(PAGE_SIZE, 0xAA)?,
            leak: Population::with_capacity(POPULATION_CAPACITY),
            no_leak: Population::with_capacity(POPULATION_CAPACITY),
        };
        info!(
            "Created campaign {}: {}",
            campaign.stats.campaign_id, campaign.stats.name
        );
        Ok(campaign)
    }

    pub fn stats(&self) -> &CampaignStats {
        &self.stats
    }

    pub fn ring_mut(&mut self) -> &mut DescriptorRing {
        &mut self.ring
    }

    pub fn leak(&self) -> &Population {
        &self.leak
    }

    pub fn no_leak(&self) -> &Population {
        &self.no_leak
    }

    /// One iteration: pick a candidate, race it and record the result.
    ///
    /// Returns `None` without recording anything when no descriptor is free.
    pub fn step(
        &mut self,
        ctx: &CampaignContext,
        rng: &mut Rng,
        log: &mut ExperimentLog,
    ) -> anyhow::Result<Option<RaceAttempt>> {
        let Some(gadget) = rng.pick(ctx.gadgets) else {
            bail!("No candidates to race");
        };

        let Some(idx) = self.ring.prepare(self.target.ptr() as u64) else {
            self.stats.skipped += 1;
            trace!("Ring exhausted, skipping iteration");
            return Ok(None);
        };
        let attempt = unsafe {
            ctx.engine
                .execute(&self.ring, idx, self.target.ptr(), self.probe.ptr())
        };
        self.ring.complete(idx, COMPLETED_LEN)?;

        if attempt.leak_detected {
            self.leak.push(attempt.leak_latency);
        } else {
            self.no_leak.push(attempt.leak_latency);
        }
        self.stats.record(attempt.leak_detected);

        log.log_experiment(&ExperimentRecord {
            timestamp: chrono::Utc::now().timestamp(),
            campaign_id: self.stats.campaign_id,
            experiment_id: self.stats.total_attempts,
            gadget_address: gadget.address,
            outcome: attempt.outcome,
            leak_detected: attempt.leak_detected,
            leak_latency: attempt.leak_latency,
            window_estimate: attempt.window_estimate,
            // the verdict is only known once the campaign is over
            p_value: 0.0,
            significant: false,
        })?;
        Ok(Some(attempt))
    }

    /// Clean both populations and run the significance test.
    pub fn finish(
        mut self,
        config: &FuzzConfig,
        rng: &mut Rng,
        progress: Option<&MultiProgress>,
        cancelled: bool,
    ) -> CampaignReport {
        info!("Running statistical validation...");
        let leak_outliers = self.leak.clean_outliers();
        let no_leak_outliers = self.no_leak.clean_outliers();

        let (bootstrap, no_verdict) =
            match bootstrap_test(&self.leak, &self.no_leak, &config.bootstrap(), rng, progress) {
                Ok(result) => (Some(result), None),
                Err(e) => {
                    warn!("Campaign '{}': no verdict: {}", self.stats.name, e);
                    (None, Some(e.to_string()))
                }
            };

        let report = CampaignReport {
            stats: self.stats,
            leak_samples: self.leak.len(),
            no_leak_samples: self.no_leak.len(),
            leak_outliers,
            no_leak_outliers,
            bootstrap,
            no_verdict,
            cancelled,
        };
        match report.bootstrap {
            Some(b) if b.is_exploitable() => {
                warn!("EXPLOITABLE LEAK FOUND in campaign '{}'", report.stats.name);
                warn!("    Median timing difference: {:.2} cycles", b.median_diff);
                warn!(
                    "    {:.0}% confidence interval: [{:.2}, {:.2}]",
                    (1.0 - config.alpha) * 100.0,
                    b.ci_lower,
                    b.ci_upper
                );
                warn!(
                    "    p-value: {:.6} (significant at alpha={:.4})",
                    b.p_value, config.alpha
                );
            }
            _ => info!("No exploitable leak detected in this campaign"),
        }
        report
    }
}

/// Run one campaign of `config.iterations_per_campaign` iterations. `cancel` is polled
/// before every iteration; a cancelled campaign still evaluates what it collected.
pub fn run_campaign(
    name: &str,
    ctx: &CampaignContext,
    config: &FuzzConfig,
    rng: &mut Rng,
    log: &mut ExperimentLog,
    cancel: &CancelToken,
    progress: Option<&MultiProgress>,
) -> anyhow::Result<CampaignReport> {
    info!("Starting campaign: {}", name);
    let mut campaign = Campaign::new(name, config.ring_size)?;
    let p = make_progress(progress, name, config.iterations_per_campaign as u64);

    let mut cancelled = false;
    for iter in 0..config.iterations_per_campaign as u64 {
        if cancel.is_cancelled() {
            info!("Campaign '{}' cancelled after {} iterations", name, iter);
            cancelled = true;
            break;
        }
        campaign.step(ctx, rng, log)?;
        update_progress(p.as_ref(), iter, campaign.stats());
    }
    if let Some(p) = p {
        p.finish_and_clear();
    }

    let report = campaign.finish(config, rng, progress, cancelled);
    info!(
        "Campaign '{}': {} attempts, {} leaks ({:.4}%), {} skipped",
        report.stats.name,
        report.stats.total_attempts,
        report.stats.successful_leaks,
        report.stats.success_rate * 100.0,
        report.stats.skipped
    );
    Ok(report)
}

/// Run `config.campaigns` campaigns in order until done or cancelled.
///
/// A campaign that fails (resources, log writes) is reported without a verdict and the
/// next one still starts.
pub fn run_campaigns(
    ctx: &CampaignContext,
    config: &FuzzConfig,
    rng: &mut Rng,
    log: &mut ExperimentLog,
    cancel: &CancelToken,
    progress: Option<&MultiProgress>,
) -> Vec<CampaignReport> {
    let mut reports = Vec::with_capacity(config.campaigns as usize);
    for c in 0..config.campaigns {
        if cancel.is_cancelled() {
            break;
        }
        let name = format!("Campaign_{}", c + 1);
        match run_campaign(&name, ctx, config, rng, log, cancel, progress) {
            Ok(report) => {
                info!("Campaign {}/{} complete", c + 1, config.campaigns);
                reports.push(report);
            }
            Err(e) => {
                error!("Campaign {}/{} failed: {:?}", c + 1, config.campaigns, e);
                reports.push(CampaignReport::failed(&name, &e));
            }
        }
    }
    reports
}

fn update_progress(p: Option<&ProgressBar>, iter: u64, stats: &CampaignStats) {
    if let Some(p) = p {
        p.inc(1);
        if iter % PROGRESS_UPDATE == 0 {
            p.set_message(format!("success rate {:.2}%", stats.success_rate * 100.0));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{env, fs, process};

    use super::*;
    use crate::{
        gadget::LoadPattern,
        race::{RaceOutcome, WindowProfile},
        timing::CalibrationProfile,
    };

    fn gadgets() -> Vec<Gadget> {
        (0..4)
            .map(|i| Gadget {
                address: 0x1000 + i * 0x10,
                length: 16,
                pattern: LoadPattern::ExtendingLoad,
                bytes: vec![0x0F, 0xB6, 0x07],
                disassembly: String::new(),
                score: 0.5,
            })
            .collect()
    }

    fn engine() -> RaceEngine {
        RaceEngine::new(
            WindowProfile {
                mean: 200,
                min: 100,
                max: 300,
                stddev: 20,
                sample_count: 100,
            },
            CalibrationProfile::from_averages(0, 60, 300),
        )
    }

    fn config(iterations: u32) -> FuzzConfig {
        FuzzConfig {
            iterations_per_campaign: iterations,
            bootstrap_rounds: 200,
            ring_size: 4,
            ..Default::default()
        }
    }

    fn temp_log(tag: &str) -> anyhow::Result<(ExperimentLog, std::path::PathBuf)> {
        let path = env::temp_dir().join(format!("campaign-{}-{}.csv", tag, process::id()));
        let _ = fs::remove_file(&path);
        Ok((ExperimentLog::open(&path)?, path))
    }

    #[test]
    fn test_stats_record() {
        let mut stats = CampaignStats::new("test");
        stats.record(true);
        stats.record(false);
        stats.record(false);
        stats.record(true);
        assert_eq!(stats.total_attempts, 4);
        assert_eq!(stats.successful_leaks, 2);
        assert_eq!(stats.success_rate, 0.5);
    }

    #[test]
    fn test_exhausted_ring_skips_silently() -> anyhow::Result<()> {
        let (mut log, path) = temp_log("skip")?;
        let engine = engine();
        let gadgets = gadgets();
        let ctx = CampaignContext {
            engine: &engine,
            gadgets: &gadgets,
        };
        let mut rng = Rng::from_seed(1);
        let mut campaign = Campaign::new("skip", 2)?;
        while campaign.ring_mut().prepare(0).is_some() {}

        for _ in 0..5 {
            assert_eq!(campaign.step(&ctx, &mut rng, &mut log)?, None);
        }
        assert_eq!(campaign.stats().skipped, 5);
        assert_eq!(campaign.stats().total_attempts, 0);
        assert!(campaign.leak().is_empty() && campaign.no_leak().is_empty());
        assert_eq!(log.rows(), 0);
        fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn test_step_records_into_one_population() -> anyhow::Result<()> {
        let (mut log, path) = temp_log("step")?;
        let engine = engine();
        let gadgets = gadgets();
        let ctx = CampaignContext {
            engine: &engine,
            gadgets: &gadgets,
        };
        let mut rng = Rng::from_seed(2);
        let mut campaign = Campaign::new("step", 1)?;
        for _ in 0..20 {
            let attempt = campaign.step(&ctx, &mut rng, &mut log)?;
            // descriptors are retired after every attempt, so a single slot never runs dry
            let attempt = attempt.ok_or_else(|| anyhow::anyhow!("skipped"))?;
            assert_eq!(attempt.leak_detected, attempt.outcome == RaceOutcome::Success);
        }
        assert_eq!(campaign.leak().len() + campaign.no_leak().len(), 20);
        assert_eq!(campaign.stats().successful_leaks as usize, campaign.leak().len());
        assert_eq!(log.rows(), 20);
        fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn test_run_campaign_cancelled_before_start() -> anyhow::Result<()> {
        let (mut log, path) = temp_log("cancel")?;
        let engine = engine();
        let gadgets = gadgets();
        let ctx = CampaignContext {
            engine: &engine,
            gadgets: &gadgets,
        };
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = run_campaign(
            "cancelled",
            &ctx,
            &config(100),
            &mut Rng::from_seed(3),
            &mut log,
            &cancel,
            None,
        )?;
        fs::remove_file(&path)?;
        assert!(report.cancelled);
        assert_eq!(report.stats.total_attempts, 0);
        assert!(report.bootstrap.is_none());
        assert!(report.no_verdict.is_some());
        assert!(!report.is_exploitable());
        Ok(())
    }

    #[test]
    fn test_run_campaign_completes() -> anyhow::Result<()> {
        let (mut log, path) = temp_log("run")?;
        let engine = engine();
        let gadgets = gadgets();
        let ctx = CampaignContext {
            engine: &engine,
            gadgets: &gadgets,
        };
        let report = run_campaign(
            "run",
            &ctx,
            &config(200),
            &mut Rng::from_seed(4),
            &mut log,
            &CancelToken::new(),
            None,
        )?;
        fs::remove_file(&path)?;
        assert!(!report.cancelled);
        assert_eq!(report.stats.total_attempts, 200);
        assert_eq!(report.stats.skipped, 0);
        assert_eq!(
            report.leak_samples + report.leak_outliers + report.no_leak_samples + report.no_leak_outliers,
            200
        );
        // a verdict exists exactly when both populations kept enough samples
        assert_eq!(
            report.bootstrap.is_some(),
            report.leak_samples >= 10 && report.no_leak_samples >= 10
        );
        Ok(())
    }

    #[test]
    fn test_failed_campaign_does_not_stop_run() -> anyhow::Result<()> {
        let (mut log, path) = temp_log("failing")?;
        let engine = engine();
        let gadgets = gadgets();
        let ctx = CampaignContext {
            engine: &engine,
            gadgets: &gadgets,
        };
        // a ring of size 0 cannot be built, so every campaign fails at setup
        let config = FuzzConfig {
            campaigns: 3,
            ring_size: 0,
            ..config(50)
        };
        let reports = run_campaigns(
            &ctx,
            &config,
            &mut Rng::from_seed(6),
            &mut log,
            &CancelToken::new(),
            None,
        );
        fs::remove_file(&path)?;
        assert_eq!(reports.len(), 3);
        for (i, report) in reports.iter().enumerate() {
            assert_eq!(report.stats.name, format!("Campaign_{}", i + 1));
            assert_eq!(report.stats.total_attempts, 0);
            assert!(report.bootstrap.is_none());
            assert!(report
                .no_verdict
                .as_deref()
                .is_some_and(|msg| msg.starts_with("campaign failed")));
            assert!(!report.is_exploitable());
        }
        assert_eq!(log.rows(), 0);
        Ok(())
    }

    #[test]
    fn test_failed_campaign_between_good_ones() -> anyhow::Result<()> {
        let (mut log, path) = temp_log("mixed")?;
        let engine = engine();
        let gadgets = gadgets();
        let good = CampaignContext {
            engine: &engine,
            gadgets: &gadgets,
        };
        let empty = CampaignContext {
            engine: &engine,
            gadgets: &[],
        };
        let config = FuzzConfig {
            campaigns: 1,
            ..config(30)
        };
        let mut rng = Rng::from_seed(8);
        let cancel = CancelToken::new();
        let mut reports = run_campaigns(&good, &config, &mut rng, &mut log, &cancel, None);
        // no candidates: the step fails, the campaign is recorded and the run goes on
        reports.extend(run_campaigns(&empty, &config, &mut rng, &mut log, &cancel, None));
        reports.extend(run_campaigns(&good, &config, &mut rng, &mut log, &cancel, None));
        fs::remove_file(&path)?;

        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].stats.total_attempts, 30);
        assert!(reports[1]
            .no_verdict
            .as_deref()
            .is_some_and(|msg| msg.starts_with("campaign failed")));
        assert_eq!(reports[2].stats.total_attempts, 30);
        assert_eq!(log.rows(), 60);
        Ok(())
    }

    #[test]
    fn test_run_campaigns_stops_when_cancelled() -> anyhow::Result<()> {
        let (mut log, path) = temp_log("cancel-all")?;
        let engine = engine();
        let gadgets = gadgets();
        let ctx = CampaignContext {
            engine: &engine,
            gadgets: &gadgets,
        };
        let cancel = CancelToken::new();
        cancel.cancel();
        let config = FuzzConfig {
            campaigns: 5,
            ..config(10)
        };
        let reports = run_campaigns(&ctx, &config, &mut Rng::from_seed(7), &mut log, &cancel, None);
        fs::remove_file(&path)?;
        assert!(reports.is_empty());
        Ok(())
    }

    #[test]
    fn test_no_candidates_is_error() -> anyhow::Result<()> {
        let (mut log, path) = temp_log("empty")?;
        let engine = engine();
        let ctx = CampaignContext {
            engine: &engine,
            gadgets: &[],
        };
        let mut campaign = Campaign::new("empty", 4)?;
        assert!(campaign.step(&ctx, &mut Rng::from_seed(5), &mut log).is_err());
        fs::remove_file(&path)?;
        Ok(())
    }
}
