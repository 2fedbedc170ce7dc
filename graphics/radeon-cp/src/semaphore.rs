// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Hardware semaphores for cross-ring waits
//!
//! Each semaphore is an 8-byte slot in DMA memory. A signal packet on the
//! producing ring increments it, a wait packet on the consuming ring blocks
//! that ring until it is non-zero and decrements it. A slot goes back to the
//! pool once the fence emitted behind the wait has signaled.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::dma::DmaRegion;
use crate::fence::Fence;
use crate::{Error, Result};

/// Words per semaphore slot
const SLOT_WORDS: usize = 2;

/// Checked-out semaphore slot
#[derive(Debug)]
pub struct Semaphore {
    index: usize,
    addr: u64,
}

impl Semaphore {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Bus address the semaphore packets point at
    pub fn gpu_addr(&self) -> u64 {
        self.addr
    }
}

enum Slot {
    Free,
    InUse,
    /// Reusable once the fence signals
    Releasing(Fence),
}

/// Fixed pool of semaphore slots
pub struct SemaphorePool {
    region: Arc<DmaRegion>,
    slots: Mutex<Vec<Slot>>,
}

impl SemaphorePool {
    pub fn new(region: Arc<DmaRegion>) -> Self {
        let count = region.len() / SLOT_WORDS;
        Self {
            region,
            slots: Mutex::new((0..count).map(|_| Slot::Free).collect()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Take a cleared slot, `Busy` if every slot is still in flight
    pub fn alloc(&self) -> Result<Semaphore> {
        let mut slots = self.slots.lock();
        let index = slots
            .iter()
            .position(|slot| match slot {
                Slot::Free => true,
                Slot::InUse => false,
                Slot::Releasing(fence) => fence.signaled(),
            })
            .ok_or(Error::Busy)?;

        slots[index] = Slot::InUse;
        let word = index * SLOT_WORDS;
        self.region.write(word, 0);
        self.region.write(word + 1, 0);
        Ok(Semaphore {
            index,
            addr: self.region.addr_of(word),
        })
    }

    /// Return a slot, held back until `fence` signals if one is given
    pub fn free(&self, sem: Semaphore, fence: Option<Fence>) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(sem.index) {
            *slot = match fence {
                Some(fence) => Slot::Releasing(fence),
                None => Slot::Free,
            };
        }
    }

    /// Current counter value
    pub fn value(&self, sem: &Semaphore) -> u32 {
        self.region.read(sem.index * SLOT_WORDS)
    }

    /// Slots not immediately available
    pub fn in_use(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|slot| match slot {
                Slot::Free => false,
                Slot::InUse => true,
                Slot::Releasing(fence) => !fence.signaled(),
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asic::{Asic, R100};
    use crate::clock::MonotonicClock;
    use crate::fence::{FenceDriver, FenceLocation};
    use crate::regs::r100;
    use crate::ring::RingBuffer;
    use crate::sim::RegisterMap;
    use crate::stats::CpStats;
    use std::time::Duration;

    #[test]
    fn test_alloc_until_exhausted() {
        let pool = SemaphorePool::new(Arc::new(DmaRegion::new(0x4000, 4)));
        assert_eq!(pool.capacity(), 2);

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!(b.gpu_addr(), 0x4008);
        assert_eq!(pool.alloc().err(), Some(Error::Busy));

        pool.free(a, None);
        assert_eq!(pool.alloc().unwrap().index(), 0);
        assert_eq!(pool.value(&b), 0);
    }

    #[test]
    fn test_slot_held_until_fence() {
        let regs = Arc::new(RegisterMap::new());
        let clock = Arc::new(MonotonicClock::new());
        let driver = Arc::new(FenceDriver::new(
            regs.clone(),
            clock.clone(),
            Arc::new(CpStats::new()),
            1,
            Duration::from_secs(10),
            Duration::from_millis(5),
        ));
        let reg = r100::SCRATCH_REG0 + 12;
        driver
            .init_ring(0, FenceLocation::Scratch { reg, mirror: None })
            .unwrap();

        let desc = R100.ring_desc(0);
        let mut ring = RingBuffer::new(
            0,
            desc.kind,
            Arc::new(DmaRegion::new(0x10_0000, 1024)),
            regs.clone(),
            clock,
            desc.layout,
            desc.align_mask,
            desc.nop,
        )
        .unwrap();
        ring.set_ready(true);
        ring.reserve(R100.fence_dw(0), 0).unwrap();
        let fence = driver.emit(&mut ring, &R100).unwrap();
        ring.commit();

        let pool = SemaphorePool::new(Arc::new(DmaRegion::new(0x4000, 2)));
        let sem = pool.alloc().unwrap();
        pool.free(sem, Some(fence));
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.alloc().err(), Some(Error::Busy));

        regs.set(reg, 1);
        assert_eq!(pool.in_use(), 0);
        assert!(pool.alloc().is_ok());
    }
}
