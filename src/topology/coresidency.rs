use std::{
    sync::{atomic::Ordering, Arc},
    thread,
    time::Duration,
};

use anyhow::{bail, Context};
use serde::Serialize;

use crate::{
    memory::{BytePointer, MemBlock},
    timing::{tsc, CalibrationProfile, LineProbe},
    util::{
        cancelable_thread::spawn_cancelable, Anyhow, CORESIDENCY_HIT_RATE, CORESIDENCY_ROUNDS,
        PAGE_SIZE,
    },
};

use super::{pin_current_thread, CpuTopology};

const VICTIM_WARMUP: Duration = Duration::from_millis(10);
const RELOAD_DELAY: Duration = Duration::from_micros(10);
const VICTIM_SPIN: usize = 100;

#[derive(Clone, Debug, Serialize)]
pub struct CoresidencyResult {
    pub cpu_a: usize,
    pub cpu_b: usize,
    pub llc_shared: bool,
    pub ht_siblings: bool,
    /// Fraction of rounds that reloaded faster than the miss threshold.
    pub confidence: f64,
    pub avg_hit_latency: u64,
}

impl CoresidencyResult {
    /// Evaluate the fast reloads (`hits`) observed over `rounds` flush/reload rounds.
    pub fn from_hits(
        cpu_a: usize,
        cpu_b: usize,
        hits: &[u64],
        rounds: usize,
        ht_siblings: bool,
    ) -> Self {
        let hit_rate = if rounds == 0 {
            0.0
        } else {
            hits.len() as f64 / rounds as f64
        };
        let avg_hit_latency = if hits.is_empty() {
            0
        } else {
            hits.iter().sum::<u64>() / hits.len() as u64
        };
        CoresidencyResult {
            cpu_a,
            cpu_b,
            llc_shared: hit_rate > CORESIDENCY_HIT_RATE,
            ht_siblings,
            confidence: hit_rate,
            avg_hit_latency,
        }
    }
}

/// Run `rounds` rounds of flush, short delay, timed reload on `line` and return the
/// latencies below `threshold`.
///
/// # Safety
/// `line` must be valid for an 8-byte read for the whole call.
pub unsafe fn sample_reloads(
    probe: &dyn LineProbe,
    line: *const u8,
    threshold: u64,
    rounds: usize,
    delay: Duration,
) -> Vec<u64> {
    let mut hits = Vec::with_capacity(rounds);
    for _ in 0..rounds {
        probe.flush(line);
        tsc::mfence();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let reload = probe.probe_time(line);
        if reload < threshold {
            hits.push(reload);
        }
    }
    hits
}

/// Verifies that two logical CPUs share a last-level cache by letting a pinned victim
/// worker touch a shared line while the calling thread flushes and reloads it.
///
/// Verification pins the *calling* thread to the attacker CPU and leaves it pinned, so
/// after a successful scan the caller keeps running on the co-resident attacker CPU.
pub struct CoresidencyVerifier<'a> {
    topology: &'a CpuTopology,
    calibration: CalibrationProfile,
    probe: Box<dyn LineProbe>,
    rounds: usize,
}

impl<'a> CoresidencyVerifier<'a> {
    pub fn new(
        topology: &'a CpuTopology,
        calibration: CalibrationProfile,
        probe: Box<dyn LineProbe>,
    ) -> Self {
        Self {
            topology,
            calibration,
            probe,
            rounds: CORESIDENCY_ROUNDS,
        }
    }

    pub fn with_rounds(mut self, rounds: usize) -> Self {
        self.rounds = rounds;
        self
    }

    /// Prove (or refute) that `cpu_a` (attacker) and `cpu_b` (victim) share the LLC.
    ///
    /// The victim worker is always stopped and joined before this returns, on every path.
    pub fn verify_llc_sharing(
        &self,
        cpu_a: usize,
        cpu_b: usize,
    ) -> anyhow::Result<CoresidencyResult> {
        if self.topology.cpu(cpu_a).is_none() || self.topology.cpu(cpu_b).is_none() {
            bail!("CPU pair ({}, {}) not in topology", cpu_a, cpu_b);
        }
        let shared = Arc::new(MemBlock::mmap(PAGE_SIZE, 0xAA).context("shared line")?);
        let line = shared.ptr() as *const u8;

        let victim_mem = Arc::clone(&shared);
        let victim = spawn_cancelable("llc-victim", move |running| -> anyhow::Result<u64> {
            pin_current_thread(cpu_b)?;
            let mut reads = 0u64;
            while running.load(Ordering::Acquire) {
                victim_mem.read_u64(0);
                for _ in 0..VICTIM_SPIN {
                    std::hint::spin_loop();
                }
                reads += 1;
            }
            Ok(reads)
        })
        .context("spawn victim worker")?;

        thread::sleep(VICTIM_WARMUP);

        let measured = pin_current_thread(cpu_a).map(|_| unsafe {
            sample_reloads(
                self.probe.as_ref(),
                line,
                self.calibration.miss_threshold,
                self.rounds,
                RELOAD_DELAY,
            )
        });

        let victim_reads = victim.join().anyhow().context("victim worker panicked")?;
        let hits = measured?;
        let victim_reads = victim_reads.context("victim worker")?;
        debug!("Victim performed {} reads", victim_reads);

        let result = CoresidencyResult::from_hits(
            cpu_a,
            cpu_b,
            &hits,
            self.rounds,
            self.topology.are_siblings(cpu_a, cpu_b),
        );
        info!(
            "[{}] Co-residency test: CPU {} <-> CPU {}, hit rate {:.2}%, avg latency {} cycles",
            if result.llc_shared { "+" } else { "-" },
            cpu_a,
            cpu_b,
            result.confidence * 100.0,
            result.avg_hit_latency
        );
        Ok(result)
    }

    /// Verify same-socket CPU pairs in order until the first LLC-sharing pair is found.
    ///
    /// Returns `Ok(None)` when every pair was tried without success. Pairs whose
    /// verification fails (e.g. the CPU cannot be pinned) are skipped.
    pub fn scan_for_coresident_pair(&self) -> anyhow::Result<Option<CoresidencyResult>> {
        info!("Scanning for co-resident CPUs...");
        for (a, b) in self.topology.same_socket_pairs() {
            match self.verify_llc_sharing(a, b) {
                Ok(result) if result.llc_shared => {
                    info!("Found co-resident pair: CPU {} <-> CPU {}", a, b);
                    return Ok(Some(result));
                }
                Ok(_) => {}
                Err(e) => warn!("Verification of CPU {} <-> CPU {} failed: {:?}", a, b, e),
            }
        }
        warn!("No co-resident CPUs found");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, time::Duration};

    use super::*;
    use crate::topology::current_cpu;

    /// Probe that reports a fixed reload latency.
    struct FixedProbe {
        latency: u64,
        flushes: Cell<usize>,
    }

    impl LineProbe for FixedProbe {
        unsafe fn flush(&self, _addr: *const u8) {
            self.flushes.set(self.flushes.get() + 1);
        }
        unsafe fn probe_time(&self, _addr: *const u8) -> u64 {
            self.latency
        }
    }

    fn cal() -> CalibrationProfile {
        CalibrationProfile::from_averages(0, 40, 220)
    }

    #[test]
    fn test_synthetic_full_hit_rate_is_shared() {
        let probe = FixedProbe {
            latency: 50,
            flushes: Cell::new(0),
        };
        let line = [0u64; 8];
        let hits = unsafe {
            sample_reloads(
                &probe,
                line.as_ptr() as *const u8,
                cal().miss_threshold,
                1000,
                Duration::ZERO,
            )
        };
        assert_eq!(probe.flushes.get(), 1000);
        let result = CoresidencyResult::from_hits(0, 1, &hits, 1000, false);
        assert!(result.llc_shared);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.avg_hit_latency, 50);
    }

    #[test]
    fn test_synthetic_zero_hit_rate_not_shared() {
        let probe = FixedProbe {
            latency: 400,
            flushes: Cell::new(0),
        };
        let line = [0u64; 8];
        let hits = unsafe {
            sample_reloads(
                &probe,
                line.as_ptr() as *const u8,
                cal().miss_threshold,
                1000,
                Duration::ZERO,
            )
        };
        let result = CoresidencyResult::from_hits(0, 1, &hits, 1000, false);
        assert!(!result.llc_shared);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.avg_hit_latency, 0);
    }

    #[test]
    fn test_hit_rate_threshold_is_strict() {
        let hits = vec![10; 100];
        assert!(!CoresidencyResult::from_hits(0, 1, &hits, 1000, false).llc_shared);
        let hits = vec![10; 101];
        assert!(CoresidencyResult::from_hits(0, 1, &hits, 1000, false).llc_shared);
    }

    #[test]
    fn test_verify_joins_victim_with_synthetic_probe() -> anyhow::Result<()> {
        let cpu = current_cpu()?;
        let ids = vec![(0, 0); cpu + 1];
        let topo = CpuTopology::from_ids(&ids);
        // run in a scratch thread so the test harness thread keeps its affinity
        let result = thread::scope(|s| {
            s.spawn(|| {
                let probe = Box::new(FixedProbe {
                    latency: 10,
                    flushes: Cell::new(0),
                });
                CoresidencyVerifier::new(&topo, cal(), probe)
                    .with_rounds(20)
                    .verify_llc_sharing(cpu, cpu)
            })
            .join()
        });
        let result = result.anyhow()??;
        assert!(result.llc_shared);
        assert!(result.ht_siblings);
        Ok(())
    }

    #[test]
    fn test_verify_rejects_unknown_cpu() {
        let topo = CpuTopology::from_ids(&[(0, 0)]);
        let verifier = CoresidencyVerifier::new(
            &topo,
            cal(),
            Box::new(FixedProbe {
                latency: 10,
                flushes: Cell::new(0),
            }),
        );
        assert!(verifier.verify_llc_sharing(0, 5).is_err());
    }
}
