// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! DMA-visible memory shared between the CPU and the GPU
//!
//! Ring buffers, the writeback page, command buffers and semaphores all live
//! in [`DmaRegion`]s handed out by a [`DmaAllocator`] (the GART/PCI-DMA
//! mapping provider). Words are atomics so the GPU side may observe them
//! concurrently; ordering towards the GPU is established by the explicit
//! fence in [`crate::ring::RingBuffer::commit`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::{Error, Result};

/// GART page size
pub const GART_PAGE_SIZE: u64 = 4096;

/// Word-addressed DMA memory at a fixed bus address
pub struct DmaRegion {
    bus_addr: u64,
    words: Box<[AtomicU32]>,
}

impl DmaRegion {
    /// Allocate zeroed host memory for `len` words at `bus_addr`
    pub fn new(bus_addr: u64, len: usize) -> Self {
        Self {
            bus_addr,
            words: (0..len).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Bus address of word 0
    pub fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    /// Length in words
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Length in bytes
    pub fn byte_len(&self) -> u64 {
        self.words.len() as u64 * 4
    }

    /// Read word `index`
    pub fn read(&self, index: usize) -> u32 {
        self.words[index].load(Ordering::Acquire)
    }

    /// Write word `index`
    pub fn write(&self, index: usize, val: u32) {
        self.words[index].store(val, Ordering::Relaxed);
    }

    /// Word index of a bus address inside this region
    pub fn index_of(&self, addr: u64) -> Option<usize> {
        if addr < self.bus_addr || addr % 4 != 0 {
            return None;
        }
        let index = ((addr - self.bus_addr) / 4) as usize;
        (index < self.words.len()).then_some(index)
    }

    /// Bus address of word `index`
    pub fn addr_of(&self, index: usize) -> u64 {
        self.bus_addr + index as u64 * 4
    }
}

/// GART/PCI-DMA mapping provider
pub trait DmaAllocator: Send + Sync {
    /// Allocate and map `words` words of DMA memory
    fn alloc(&self, words: usize) -> Result<Arc<DmaRegion>>;

    /// Unmap a region previously returned by `alloc`
    fn free(&self, region: &DmaRegion);
}

/// First-fit allocator over a GART aperture
pub struct GartAperture {
    inner: Mutex<ApertureState>,
}

struct ApertureState {
    base: u64,
    size: u64,
    next: u64,
    /// Freed ranges below `next`, as (offset, len)
    holes: Vec<(u64, u64)>,
}

impl GartAperture {
    /// Create an aperture of `size` bytes at bus address `base`
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            inner: Mutex::new(ApertureState {
                base,
                size,
                next: 0,
                holes: Vec::new(),
            }),
        }
    }

    /// Bytes not yet handed out
    pub fn available(&self) -> u64 {
        let state = self.inner.lock();
        state.size - state.next + state.holes.iter().map(|(_, len)| len).sum::<u64>()
    }
}

impl DmaAllocator for GartAperture {
    fn alloc(&self, words: usize) -> Result<Arc<DmaRegion>> {
        if words == 0 {
            return Err(Error::InvalidArgument("empty DMA allocation"));
        }
        let bytes = words as u64 * 4;
        let aligned = (bytes + GART_PAGE_SIZE - 1) & !(GART_PAGE_SIZE - 1);

        let mut state = self.inner.lock();
        let offset = if let Some(pos) = state.holes.iter().position(|&(_, len)| len >= aligned) {
            let (offset, len) = state.holes[pos];
            if len == aligned {
                state.holes.remove(pos);
            } else {
                state.holes[pos] = (offset + aligned, len - aligned);
            }
            offset
        } else {
            if state.next + aligned > state.size {
                log::warn!(
                    "radeon: GART aperture exhausted ({} of {} bytes used)",
                    state.next,
                    state.size
                );
                return Err(Error::OutOfMemory);
            }
            let offset = state.next;
            state.next += aligned;
            offset
        };

        Ok(Arc::new(DmaRegion::new(state.base + offset, words)))
    }

    fn free(&self, region: &DmaRegion) {
        let mut state = self.inner.lock();
        let Some(offset) = region.bus_addr().checked_sub(state.base) else {
            log::error!("radeon: freeing {:#x} outside the aperture", region.bus_addr());
            return;
        };
        let len = (region.byte_len() + GART_PAGE_SIZE - 1) & !(GART_PAGE_SIZE - 1);
        if offset + len == state.next {
            state.next = offset;
        } else {
            state.holes.push((offset, len));
        }
    }
}
