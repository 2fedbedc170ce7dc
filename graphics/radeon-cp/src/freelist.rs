// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! DMA buffer freelist with age tracking
//!
//! Every buffer moves `Free -> CheckedOut -> Pending -> Free`. A pending
//! buffer carries the dispatch age that was written into the ring behind
//! it, and becomes reusable once the hardware's last-dispatch counter has
//! reached that age.

use std::sync::Arc;

use crate::clock::{poll_us, Clock};
use crate::dma::DmaRegion;
use crate::stats::CpStats;
use crate::{Error, Result};

/// Process identifier of a buffer owner
pub type Pid = u32;

/// Lifecycle state of one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Free,
    CheckedOut { pid: Pid },
    Pending { pid: Pid, age: u32 },
}

/// One DMA buffer carved out of the shared buffer region
#[derive(Debug, Clone)]
pub struct CommandBuffer {
    index: usize,
    /// Byte offset into the buffer region
    offset: usize,
    /// Capacity in bytes
    size: usize,
    /// Bytes filled by the client
    used: usize,
    bus_addr: u64,
    state: BufferState,
}

impl CommandBuffer {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Bus address of the first byte
    pub fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn owner(&self) -> Option<Pid> {
        match self.state {
            BufferState::Free => None,
            BufferState::CheckedOut { pid } | BufferState::Pending { pid, .. } => Some(pid),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, BufferState::Pending { .. })
    }

    pub fn age(&self) -> Option<u32> {
        match self.state {
            BufferState::Pending { age, .. } => Some(age),
            _ => None,
        }
    }
}

/// Pool of equally sized DMA buffers
pub struct Freelist {
    region: Arc<DmaRegion>,
    bufs: Vec<CommandBuffer>,
    rotate: bool,
    /// Index returned by the previous acquire
    last: usize,
}

impl Freelist {
    /// Split `region` into `count` buffers of `size` bytes
    pub fn new(region: Arc<DmaRegion>, count: usize, size: usize, rotate: bool) -> Result<Self> {
        if count == 0 || size == 0 || size % 4 != 0 {
            return Err(Error::InvalidArgument("buffer geometry"));
        }
        if (count * size) as u64 > region.byte_len() {
            return Err(Error::InvalidArgument("buffer region too small"));
        }

        let bufs = (0..count)
            .map(|index| CommandBuffer {
                index,
                offset: index * size,
                size,
                used: 0,
                bus_addr: region.bus_addr() + (index * size) as u64,
                state: BufferState::Free,
            })
            .collect();

        Ok(Self {
            region,
            bufs,
            rotate,
            last: count - 1,
        })
    }

    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Backing region shared by all buffers
    pub fn region(&self) -> &Arc<DmaRegion> {
        &self.region
    }

    pub fn get(&self, index: usize) -> Option<&CommandBuffer> {
        self.bufs.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandBuffer> {
        self.bufs.iter()
    }

    /// Check out a buffer for `pid`
    ///
    /// Free buffers are handed out first. Otherwise polls `done_age` (the
    /// hardware last-dispatch counter) every microsecond for `usec_timeout`
    /// and recycles the first pending buffer whose age has been reached.
    pub fn acquire(
        &mut self,
        pid: Pid,
        mut done_age: impl FnMut() -> u32,
        clock: &dyn Clock,
        usec_timeout: u32,
        stats: &CpStats,
    ) -> Option<usize> {
        stats.record_buffer_request();

        let count = self.bufs.len();
        let start = if self.rotate { (self.last + 1) % count } else { 0 };
        let order = move |i: usize| (start + i) % count;

        let found = (0..count)
            .map(order)
            .find(|&index| self.bufs[index].state == BufferState::Free)
            .or_else(|| {
                let bufs = &self.bufs;
                poll_us(clock, usec_timeout, 1, || {
                    let done = done_age();
                    let index = (0..count).map(order).find(|&index| {
                        matches!(bufs[index].state, BufferState::Pending { age, .. } if age <= done)
                    });
                    if index.is_none() {
                        stats.record_freelist_loop();
                    }
                    index
                })
            });

        match found {
            Some(index) => {
                let buf = &mut self.bufs[index];
                buf.state = BufferState::CheckedOut { pid };
                buf.used = 0;
                self.last = index;
                Some(index)
            }
            None => {
                stats.record_freelist_timeout();
                log::warn!("radeon: freelist empty after {}us", usec_timeout);
                None
            }
        }
    }

    fn checked_out(&mut self, index: usize, pid: Pid) -> Result<&mut CommandBuffer> {
        let buf = self
            .bufs
            .get_mut(index)
            .ok_or(Error::InvalidArgument("buffer index out of range"))?;
        match buf.state {
            BufferState::CheckedOut { pid: owner } if owner == pid => Ok(buf),
            BufferState::CheckedOut { .. } => Err(Error::NotOwner { index }),
            BufferState::Pending { .. } => Err(Error::InvalidArgument("buffer already pending")),
            BufferState::Free => Err(Error::NotOwner { index }),
        }
    }

    /// Validate that `pid` may dispatch `bytes` bytes from buffer `index`
    pub fn check_dispatch(&mut self, index: usize, pid: Pid, bytes: usize) -> Result<&CommandBuffer> {
        let buf = self.checked_out(index, pid)?;
        if bytes > buf.size || bytes % 4 != 0 {
            return Err(Error::InvalidArgument("dispatch size"));
        }
        buf.used = bytes;
        Ok(buf)
    }

    /// Mark buffer `index` pending until the hardware reaches `age`
    pub fn discard(&mut self, index: usize, pid: Pid, age: u32) -> Result<()> {
        let buf = self.checked_out(index, pid)?;
        buf.state = BufferState::Pending { pid, age };
        Ok(())
    }

    /// Buffers `pid` still holds checked out
    pub fn reclaim(&self, pid: Pid) -> Vec<usize> {
        self.bufs
            .iter()
            .filter(|buf| buf.state == BufferState::CheckedOut { pid })
            .map(|buf| buf.index)
            .collect()
    }

    /// Forget every outstanding age after an engine reset
    pub fn reset_all(&mut self) {
        for buf in &mut self.bufs {
            if let BufferState::Pending { pid, .. } = buf.state {
                buf.state = BufferState::Pending { pid, age: 0 };
            }
        }
        self.last = self.bufs.len() - 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::ManualClock;

    fn freelist(count: usize, rotate: bool) -> Freelist {
        let region = Arc::new(DmaRegion::new(0x10_0000, count * 1024));
        Freelist::new(region, count, 4096, rotate).unwrap()
    }

    #[test]
    fn test_geometry() {
        let list = freelist(4, false);
        let buf = list.get(2).unwrap();
        assert_eq!(buf.offset(), 8192);
        assert_eq!(buf.bus_addr(), 0x10_2000);
        assert_eq!(buf.state(), BufferState::Free);

        let region = Arc::new(DmaRegion::new(0, 1024));
        assert!(Freelist::new(region, 2, 4096, false).is_err());
    }

    #[test]
    fn test_acquire_discard_reuse() {
        let mut list = freelist(4, false);
        let clock = ManualClock::new();
        let stats = CpStats::new();

        for expected in 0..4 {
            assert_eq!(list.acquire(1, || 0, &clock, 10, &stats), Some(expected));
        }
        assert_eq!(list.acquire(1, || 0, &clock, 10, &stats), None);

        list.discard(2, 1, 5).unwrap();
        assert_eq!(list.acquire(1, || 4, &clock, 10, &stats), None);
        assert_eq!(list.acquire(1, || 5, &clock, 10, &stats), Some(2));
        assert_eq!(list.get(2).unwrap().state(), BufferState::CheckedOut { pid: 1 });

        let snap = stats.snapshot();
        assert_eq!(snap.buffers_requested, 7);
        assert_eq!(snap.freelist_timeouts, 2);
    }

    #[test]
    fn test_pending_reclaimed_during_poll() {
        let mut list = freelist(1, false);
        let clock = ManualClock::new();
        let stats = CpStats::new();

        list.acquire(1, || 0, &clock, 0, &stats).unwrap();
        list.discard(0, 1, 3).unwrap();

        let mut hw = 0;
        let index = list.acquire(
            2,
            || {
                hw += 1;
                hw
            },
            &clock,
            100,
            &stats,
        );
        assert_eq!(index, Some(0));
        assert_eq!(hw, 3);
        assert_eq!(clock.now_us(), 2);
    }

    #[test]
    fn test_rotation() {
        let mut list = freelist(3, true);
        let clock = ManualClock::new();
        let stats = CpStats::new();

        assert_eq!(list.acquire(1, || 0, &clock, 0, &stats), Some(0));
        list.discard(0, 1, 1).unwrap();
        assert_eq!(list.acquire(1, || 1, &clock, 0, &stats), Some(1));
        assert_eq!(list.acquire(1, || 1, &clock, 0, &stats), Some(2));
        // Buffer 0 is aged out and next in rotation order.
        assert_eq!(list.acquire(1, || 1, &clock, 0, &stats), Some(0));
    }

    #[test]
    fn test_discard_validation() {
        let mut list = freelist(2, false);
        let clock = ManualClock::new();
        let stats = CpStats::new();

        list.acquire(7, || 0, &clock, 0, &stats).unwrap();
        assert!(matches!(list.discard(9, 7, 1), Err(Error::InvalidArgument(_))));
        assert_eq!(list.discard(0, 8, 1), Err(Error::NotOwner { index: 0 }));
        assert_eq!(list.discard(1, 7, 1), Err(Error::NotOwner { index: 1 }));
        list.discard(0, 7, 1).unwrap();
        assert!(matches!(list.discard(0, 7, 2), Err(Error::InvalidArgument(_))));
        assert!(matches!(list.check_dispatch(0, 7, 4), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_check_dispatch_size() {
        let mut list = freelist(1, false);
        let clock = ManualClock::new();
        let stats = CpStats::new();

        list.acquire(1, || 0, &clock, 0, &stats).unwrap();
        assert!(list.check_dispatch(0, 1, 8192).is_err());
        assert!(list.check_dispatch(0, 1, 6).is_err());
        assert_eq!(list.check_dispatch(0, 1, 64).unwrap().used(), 64);
    }

    #[test]
    fn test_never_hands_out_unfinished() {
        let mut list = freelist(4, true);
        let clock = ManualClock::new();
        let stats = CpStats::new();
        let mut age = 0;
        let mut hw_done = 0;

        for round in 0..64u32 {
            let before: Vec<BufferState> = list.iter().map(|buf| buf.state()).collect();
            if let Some(index) = list.acquire(1, || hw_done, &clock, 0, &stats) {
                if let BufferState::Pending { age: old, .. } = before[index] {
                    assert!(old <= hw_done);
                }
                age += 1;
                list.discard(index, 1, age).unwrap();
            }
            if round % 3 == 0 {
                hw_done = age.saturating_sub(1);
            }
        }
        assert!(age > 4);
    }

    #[test]
    fn test_reset_and_reclaim() {
        let mut list = freelist(3, false);
        let clock = ManualClock::new();
        let stats = CpStats::new();

        for _ in 0..3 {
            list.acquire(4, || 0, &clock, 0, &stats).unwrap();
        }
        list.discard(0, 4, 100).unwrap();
        assert_eq!(list.reclaim(4), vec![1, 2]);
        assert!(list.reclaim(5).is_empty());

        list.reset_all();
        assert_eq!(list.get(0).unwrap().age(), Some(0));
        assert_eq!(list.acquire(4, || 0, &clock, 0, &stats), Some(0));
    }
}
