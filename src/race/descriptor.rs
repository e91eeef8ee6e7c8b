use std::sync::atomic::{fence, AtomicU64, Ordering};

use thiserror::Error;

use crate::util::{MAX_RING_SIZE, PAGE_SIZE};

pub const DESC_F_NEXT: u16 = 1;
pub const DESC_F_WRITE: u16 = 2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RingError {
    #[error("Invalid ring capacity {0} (must be 1..=256)")]
    InvalidCapacity(usize),
    #[error("Descriptor {0} is not in flight")]
    NotInFlight(u16),
}

/// A transfer descriptor, laid out like a split-virtqueue descriptor (16 bytes).
///
/// The address is atomic so it can be rewritten while a device may be reading it.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Descriptor {
    addr: AtomicU64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Descriptor {
    pub fn addr(&self) -> u64 {
        self.addr.load(Ordering::Acquire)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsedElem {
    pub id: u32,
    pub len: u32,
}

/// Fixed-capacity descriptor ring with a free list and available/used rings.
///
/// Free descriptors are chained through `next`; `free_head == capacity` means the ring is
/// exhausted. The free-list head never names an in-flight descriptor. The ring never
/// grows, and it is owned by a single thread: the driver side (`prepare`) and the
/// simulated device side (`complete`) are both called from the campaign loop.
pub struct DescriptorRing {
    desc: Vec<Descriptor>,
    avail: Vec<u16>,
    avail_idx: u16,
    used: Vec<UsedElem>,
    used_idx: u16,
    free_head: u16,
    in_flight: Vec<bool>,
}

impl DescriptorRing {
    pub fn new(capacity: usize) -> Result<Self, RingError> {
        if capacity == 0 || capacity > MAX_RING_SIZE {
            return Err(RingError::InvalidCapacity(capacity));
        }
        let desc = (0..capacity)
            .map(|i| Descriptor {
                next: (i + 1) as u16,
                flags: if i + 1 < capacity { DESC_F_NEXT } else { 0 },
                ..Default::default()
            })
            .collect();
        Ok(DescriptorRing {
            desc,
            avail: vec![0; capacity],
            avail_idx: 0,
            used: vec![UsedElem::default(); capacity],
            used_idx: 0,
            free_head: 0,
            in_flight: vec![false; capacity],
        })
    }

    pub fn capacity(&self) -> usize {
        self.desc.len()
    }

    pub fn free_head(&self) -> u16 {
        self.free_head
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.iter().filter(|&&f| f).count()
    }

    pub fn avail_idx(&self) -> u16 {
        self.avail_idx
    }

    pub fn descriptor(&self, idx: u16) -> &Descriptor {
        &self.desc[idx as usize]
    }

    /// Take a free descriptor pointing at `initial_addr` and publish it in the available
    /// ring. Returns `None` if every descriptor is in flight.
    pub fn prepare(&mut self, initial_addr: u64) -> Option<u16> {
        if self.free_head as usize >= self.capacity() {
            return None;
        }
        let idx = self.free_head;
        let desc = &mut self.desc[idx as usize];
        self.free_head = desc.next;
        desc.addr.store(initial_addr, Ordering::Relaxed);
        desc.len = PAGE_SIZE as u32;
        desc.flags = DESC_F_WRITE;
        desc.next = 0;
        self.in_flight[idx as usize] = true;

        let slot = self.avail_idx as usize % self.capacity();
        self.avail[slot] = idx;
        // descriptor contents must be visible before the index that publishes it
        fence(Ordering::SeqCst);
        self.avail_idx = self.avail_idx.wrapping_add(1);

        trace!("Prepared descriptor {} -> 0x{:x}", idx, initial_addr);
        Some(idx)
    }

    /// Rewrite the target address of descriptor `idx`, fully fenced on both sides.
    pub fn swap_address(&self, idx: u16, new_addr: u64) {
        fence(Ordering::SeqCst);
        self.desc[idx as usize]
            .addr
            .store(new_addr, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    /// Device side: retire `idx` into the used ring and return it to the free list.
    pub fn complete(&mut self, idx: u16, written: u32) -> Result<(), RingError> {
        if !self.in_flight.get(idx as usize).copied().unwrap_or(false) {
            return Err(RingError::NotInFlight(idx));
        }
        let slot = self.used_idx as usize % self.capacity();
        self.used[slot] = UsedElem {
            id: idx as u32,
            len: written,
        };
        fence(Ordering::SeqCst);
        self.used_idx = self.used_idx.wrapping_add(1);

        let desc = &mut self.desc[idx as usize];
        desc.flags = DESC_F_NEXT;
        desc.next = self.free_head;
        self.free_head = idx;
        self.in_flight[idx as usize] = false;
        Ok(())
    }

    pub fn last_used(&self) -> Option<UsedElem> {
        if self.used_idx == 0 {
            return None;
        }
        let slot = self.used_idx.wrapping_sub(1) as usize % self.capacity();
        Some(self.used[slot])
    }
}
