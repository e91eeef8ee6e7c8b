use serde::Serialize;

use super::tsc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CacheResult {
    Hit,
    Miss,
}

/// Classify a reload latency against a threshold.
pub fn classify(elapsed: u64, threshold: u64) -> CacheResult {
    if elapsed < threshold {
        CacheResult::Hit
    } else {
        CacheResult::Miss
    }
}

pub trait LineProbe {
    /// Evict the line containing `addr` and fence.
    ///
    /// # Safety
    /// `addr` must point into mapped memory.
    unsafe fn flush(&self, addr: *const u8);

    /// Cycles taken to reload `addr`, with serializing fences around both counter reads.
    ///
    /// # Safety
    /// `addr` must be valid for an 8-byte read.
    unsafe fn probe_time(&self, addr: *const u8) -> u64;

    /// Flush, fence, reload and classify.
    ///
    /// # Safety
    /// `addr` must be valid for an 8-byte read.
    unsafe fn flush_reload(&self, addr: *const u8, threshold: u64) -> CacheResult {
        self.flush(addr);
        tsc::mfence();
        classify(self.probe_time(addr), threshold)
    }
}

pub fn construct_line_probe() -> Box<dyn LineProbe> {
    Box::new(TscProbe {})
}

/// `clflush` + `rdtsc` based probe.
pub struct TscProbe {}

impl LineProbe for TscProbe {
    unsafe fn flush(&self, addr: *const u8) {
        tsc::flush(addr)
    }

    unsafe fn probe_time(&self, addr: *const u8) -> u64 {
        tsc::probe_time(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_boundary() {
        assert_eq!(classify(79, 80), CacheResult::Hit);
        assert_eq!(classify(80, 80), CacheResult::Miss);
        assert_eq!(classify(500, 80), CacheResult::Miss);
    }

    #[test]
    fn test_flush_reload_miss_with_zero_threshold() {
        let line = [0u64; 8];
        let probe = construct_line_probe();
        let result = unsafe { probe.flush_reload(line.as_ptr() as *const u8, 0) };
        assert_eq!(result, CacheResult::Miss);
    }
}
