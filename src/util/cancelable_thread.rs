use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

/// Handle to a worker that runs until asked to stop.
///
/// The run flag has exactly one writer (the owner of this handle) and one reader
/// (the worker loop). Stores use `Release`, the worker's loads should use `Acquire`.
pub struct CancelableJoinHandle<T> {
    handle: thread::JoinHandle<T>,
    running: Arc<AtomicBool>,
}

/// Spawns a named cancelable thread that can be joined later.
/// The thread is passed an `Arc<AtomicBool>` that can be used to check if the thread should stop running.
/// The thread is requested to stop running when the `AtomicBool` is set to `false`.
///
/// Fails if the OS refuses to create the thread; nothing is leaked in that case.
pub fn spawn_cancelable<T: Send + 'static>(
    name: &str,
    func: impl FnOnce(Arc<AtomicBool>) -> T + Send + 'static,
) -> io::Result<CancelableJoinHandle<T>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || func(r))?;
    Ok(CancelableJoinHandle { handle, running })
}

impl<T> CancelableJoinHandle<T> {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Signal the worker to stop and wait for it.
    pub fn join(self) -> thread::Result<T> {
        self.running.store(false, Ordering::Release);
        self.handle.join()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::spawn_cancelable;

    #[test]
    fn test_join_stops_worker() -> anyhow::Result<()> {
        let handle = spawn_cancelable("spin", |running| {
            let mut spins = 0u64;
            while running.load(Ordering::Acquire) {
                spins = spins.wrapping_add(1);
                std::hint::spin_loop();
            }
            spins
        })?;
        assert!(handle.is_running());
        let result = handle.join();
        assert!(result.is_ok());
        Ok(())
    }
}
