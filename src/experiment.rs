//! Persistent per-attempt experiment log (CSV) and the JSON run summary.
use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Serialize, Serializer};

use crate::{
    campaign::CampaignReport,
    config::FuzzConfig,
    race::{RaceOutcome, WindowProfile},
    timing::CalibrationProfile,
    topology::CoresidencyResult,
};

/// One row of the experiment log.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExperimentRecord {
    /// Unix seconds.
    pub timestamp: i64,
    pub campaign_id: u64,
    pub experiment_id: u64,
    #[serde(serialize_with = "as_hex")]
    pub gadget_address: u64,
    pub outcome: RaceOutcome,
    #[serde(serialize_with = "as_flag")]
    pub leak_detected: bool,
    pub leak_latency: u64,
    pub window_estimate: u64,
    #[serde(serialize_with = "as_fixed6")]
    pub p_value: f64,
    #[serde(serialize_with = "as_flag")]
    pub significant: bool,
}

fn as_hex<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("0x{:x}", v))
}

fn as_flag<S: Serializer>(v: &bool, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u8(*v as u8)
}

fn as_fixed6<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("{:.6}", v))
}

/// Append-only CSV log, one row per race attempt. Every row is flushed as soon as it is
/// written.
pub struct ExperimentLog {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: u64,
}

impl ExperimentLog {
    /// Open (or create) `path` for appending. The header row is written only into an empty
    /// file.
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("open experiment log {}", path.display()))?;
        let empty = file.metadata()?.len() == 0;
        let writer = csv::WriterBuilder::new()
            .has_headers(empty)
            .from_writer(file);
        info!("Opened experiment log: {}", path.display());
        Ok(ExperimentLog {
            path,
            writer,
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written through this handle.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn log_experiment(&mut self, record: &ExperimentRecord) -> anyhow::Result<()> {
        self.writer.serialize(record)?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    /// Copy the log as written so far to `dest`.
    pub fn export<P: AsRef<Path>>(&mut self, dest: P) -> anyhow::Result<u64> {
        self.writer.flush()?;
        let dest = dest.as_ref();
        let bytes = fs::copy(&self.path, dest)
            .with_context(|| format!("export experiment log to {}", dest.display()))?;
        info!("Exported {} bytes to {}", bytes, dest.display());
        Ok(bytes)
    }
}

/// Everything a run produced, written as JSON next to the experiment log.
#[derive(Serialize)]
pub struct RunSummary<'a> {
    pub date: String,
    pub seed: u64,
    pub config: &'a FuzzConfig,
    pub calibration: CalibrationProfile,
    pub coresidency: &'a CoresidencyResult,
    pub binary_sha256: &'a str,
    pub candidates: usize,
    pub window: WindowProfile,
    pub campaigns: &'a [CampaignReport],
    pub exploitable: bool,
}

impl RunSummary<'_> {
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let mut json_file = BufWriter::new(
            File::create(path).with_context(|| format!("create {}", path.display()))?,
        );
        serde_json::to_writer_pretty(&mut json_file, self)?;
        json_file.flush()?;
        info!("Run summary written to {}", path.display());
        Ok(())
    }
}

/// Summary file name derived from the current local time.
pub fn summary_filename() -> String {
    let now = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    format!("race_summary_{}.json", now)
}

#[cfg(test)]
mod tests {
    use std::{env, process};

    use super::*;

    fn record(id: u64, leak: bool) -> ExperimentRecord {
        ExperimentRecord {
            timestamp: 1_700_000_000,
            campaign_id: 1_700_000_000_123,
            experiment_id: id,
            gadget_address: 0x1f40,
            outcome: if leak {
                RaceOutcome::Success
            } else {
                RaceOutcome::TooLate
            },
            leak_detected: leak,
            leak_latency: if leak { 60 } else { 240 },
            window_estimate: 1800,
            p_value: 0.0,
            significant: false,
        }
    }

    #[test]
    fn test_header_written_once() -> anyhow::Result<()> {
        let path = env::temp_dir().join(format!("experiment-log-{}.csv", process::id()));
        let _ = fs::remove_file(&path);
        {
            let mut log = ExperimentLog::open(&path)?;
            log.log_experiment(&record(1, true))?;
            assert_eq!(log.rows(), 1);
        }
        {
            let mut log = ExperimentLog::open(&path)?;
            log.log_experiment(&record(2, false))?;
        }
        let contents = fs::read_to_string(&path)?;
        fs::remove_file(&path)?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "timestamp,campaign_id,experiment_id,gadget_address,outcome,leak_detected,leak_latency,window_estimate,p_value,significant"
        );
        assert_eq!(
            lines[1],
            "1700000000,1700000000123,1,0x1f40,SUCCESS,1,60,1800,0.000000,0"
        );
        assert!(lines[2].contains(",TOO_LATE,0,240,"));
        Ok(())
    }

    #[test]
    fn test_export() -> anyhow::Result<()> {
        let path = env::temp_dir().join(format!("experiment-src-{}.csv", process::id()));
        let dest = env::temp_dir().join(format!("experiment-dst-{}.csv", process::id()));
        let _ = fs::remove_file(&path);
        let mut log = ExperimentLog::open(&path)?;
        log.log_experiment(&record(1, false))?;
        let bytes = log.export(&dest)?;
        let copied = fs::read_to_string(&dest)?;
        let original = fs::read_to_string(&path)?;
        fs::remove_file(&path)?;
        fs::remove_file(&dest)?;
        assert_eq!(bytes as usize, copied.len());
        assert_eq!(copied, original);
        Ok(())
    }

    #[test]
    fn test_summary_filename() {
        let name = summary_filename();
        assert!(name.starts_with("race_summary_"));
        assert!(name.ends_with(".json"));
    }
}
