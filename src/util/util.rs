use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;

use super::NamedProgress;

/// Initialize `env_logger` (default level `info`) behind a `MultiProgress`, so log
/// lines are printed above running progress bars.
pub fn init_logging_with_progress() -> anyhow::Result<MultiProgress> {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}

/// Attach a named bar of length `len` to `progress`, if any.
pub fn make_progress(progress: Option<&MultiProgress>, name: &str, len: u64) -> Option<ProgressBar> {
    progress.map(|p| p.add(ProgressBar::new(len).with_style(ProgressStyle::named_bar(name))))
}
