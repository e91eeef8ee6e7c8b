use std::ptr::null_mut;

use libc::{MAP_ANONYMOUS, MAP_POPULATE, MAP_PRIVATE};

use crate::util::{PAGE_MASK, PAGE_SIZE};

use super::{BytePointer, MemoryError};

/// A page-aligned anonymous mapping.
///
/// The block is unmapped when dropped. It is `Send + Sync` so an `Arc<MemBlock>` can be
/// shared with a worker thread; every access through it is volatile and the mapping
/// outlives all holders of the `Arc`.
#[derive(Debug)]
pub struct MemBlock {
    /// block pointer
    ptr: *mut u8,
    /// block length in bytes
    len: usize,
}

unsafe impl Send for MemBlock {}
unsafe impl Sync for MemBlock {}

impl MemBlock {
    /// Map `size` bytes (rounded up to whole pages) and fill them with `fill`.
    pub fn mmap(size: usize, fill: u8) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::ZeroSizeLayout);
        }
        let len = (size + PAGE_MASK) & !PAGE_MASK;
        let p = unsafe {
            libc::mmap(
                null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_POPULATE,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(MemoryError::AllocFailed(std::io::Error::last_os_error()));
        }
        unsafe { libc::memset(p, fill as libc::c_int, len) };
        debug_assert_eq!(p as usize % PAGE_SIZE, 0);
        trace!("Mapped {} bytes at {:p}", len, p);
        Ok(MemBlock {
            ptr: p as *mut u8,
            len,
        })
    }

    /// A single zero-filled page.
    pub fn page() -> Result<Self, MemoryError> {
        Self::mmap(PAGE_SIZE, 0x00)
    }
}

impl Drop for MemBlock {
    fn drop(&mut self) {
        let r = unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
        if r != 0 {
            error!(
                "munmap({:p}, {}): {}",
                self.ptr,
                self.len,
                std::io::Error::last_os_error()
            );
        }
    }
}

impl BytePointer for MemBlock {
    fn addr(&self, offset: usize) -> *mut u8 {
        assert!(
            offset < self.len,
            "MemBlock::addr failed. Offset {} >= {}",
            offset,
            self.len
        );
        unsafe { self.ptr.byte_add(offset) }
    }
    fn ptr(&self) -> *mut u8 {
        self.ptr
    }
    fn len(&self) -> usize {
        self.len
    }
}
