//! Serialized reads of the timestamp counter.
//!
//! Every counter read is fenced on both sides with `lfence`, so loads issued before or
//! after the read cannot be reordered across it.
use core::arch::x86_64;
use core::ptr;

/// Timestamp at the start of a measured region.
#[inline(always)]
pub fn timing_start() -> u64 {
    unsafe {
        x86_64::_mm_lfence();
        let cycles = x86_64::_rdtsc();
        x86_64::_mm_lfence();
        cycles
    }
}

/// Timestamp at the end of a measured region (`rdtscp` waits for prior instructions).
#[inline(always)]
pub fn timing_end() -> u64 {
    unsafe {
        let mut aux = 0;
        x86_64::_mm_lfence();
        let cycles = x86_64::__rdtscp(&mut aux);
        x86_64::_mm_lfence();
        cycles
    }
}

/// Cycles taken by an empty start/end pair.
#[inline(always)]
pub fn measure_empty() -> u64 {
    let start = timing_start();
    let end = timing_end();
    end.wrapping_sub(start)
}

#[inline(always)]
pub fn mfence() {
    unsafe { x86_64::_mm_mfence() }
}

/// Evict the line containing `addr` from all cache levels, then fence.
///
/// # Safety
/// `addr` must point into mapped memory.
#[inline(always)]
pub unsafe fn flush(addr: *const u8) {
    x86_64::_mm_clflush(addr);
    x86_64::_mm_mfence();
}

/// Time a single 64-bit load from `addr`.
///
/// # Safety
/// `addr` must be valid for an 8-byte read.
#[inline(always)]
pub unsafe fn probe_time(addr: *const u8) -> u64 {
    let start = timing_start();
    ptr::read_volatile(addr as *const u64);
    let end = timing_end();
    end.wrapping_sub(start)
}

/// Time `f` between two serialized counter reads.
#[inline(always)]
pub fn time<F: FnOnce()>(f: F) -> u64 {
    let start = timing_start();
    f();
    let end = timing_end();
    end.wrapping_sub(start)
}
