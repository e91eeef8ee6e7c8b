use anyhow::bail;
use libc::{cpu_set_t, sched_getcpu, sched_setaffinity, CPU_SET, CPU_SETSIZE, CPU_ZERO};

/// Pin the calling thread to logical CPU `cpu`.
pub fn pin_current_thread(cpu: usize) -> anyhow::Result<()> {
    if cpu >= CPU_SETSIZE as usize {
        bail!("CPU {} exceeds CPU_SETSIZE", cpu);
    }
    unsafe {
        let mut cpuset: cpu_set_t = std::mem::zeroed();
        CPU_ZERO(&mut cpuset);
        CPU_SET(cpu, &mut cpuset);

        // pid 0 is the calling thread
        let result = sched_setaffinity(0, std::mem::size_of::<cpu_set_t>(), &cpuset);
        if result != 0 {
            bail!(
                "Failed to pin thread to CPU {}: {}",
                cpu,
                std::io::Error::last_os_error()
            );
        }
    }
    trace!("Pinned thread {:?} to CPU {}", std::thread::current().name(), cpu);
    Ok(())
}

/// The logical CPU the calling thread is currently running on.
pub fn current_cpu() -> anyhow::Result<usize> {
    let core_id = unsafe { sched_getcpu() };
    if core_id < 0 {
        bail!(
            "Failed to get current core: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(core_id as usize)
}
