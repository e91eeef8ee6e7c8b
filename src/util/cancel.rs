use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Shared cancellation flag.
///
/// The flag is only ever raised (by a signal handler) and polled by the campaign
/// loop between whole iterations, so an attempt or a bootstrap pass always runs
/// to completion once started.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Install a SIGINT/SIGTERM handler that raises this token.
    pub fn install_signal_handler(&self) -> anyhow::Result<()> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            warn!("Received interrupt, finishing current iteration");
            token.cancel();
        })?;
        Ok(())
    }
}
