//! The `memory` module provides the page-aligned buffers shared between the attacker, the
//! victim worker and the race engine.
//!
//! - `MemBlock`: an anonymous, page-aligned mapping that is unmapped on drop.
//! - `BytePointer`: a trait for accessing memory as a byte pointer.
//! - `MemoryError`: acquisition failures.
mod memblock;

pub use self::memblock::MemBlock;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Allocation failed: {0}")]
    AllocFailed(std::io::Error),
    #[error("Zero size layout")]
    ZeroSizeLayout,
}

#[allow(clippy::len_without_is_empty)]
pub trait BytePointer {
    fn addr(&self, offset: usize) -> *mut u8;
    fn ptr(&self) -> *mut u8;
    fn len(&self) -> usize;

    /// Volatile 64-bit read at `offset`.
    fn read_u64(&self, offset: usize) -> u64 {
        assert_eq!(offset % 8, 0, "unaligned read at offset {}", offset);
        unsafe { std::ptr::read_volatile(self.addr(offset) as *const u64) }
    }
}
