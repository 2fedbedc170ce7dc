// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Command ring buffers
//!
//! A ring is a power-of-two array of 32-bit command words in DMA memory.
//! The CPU owns `tail` and publishes it through the write pointer register;
//! the command processor owns `head` and reports it through the read pointer
//! register or the writeback page. One word always stays unused so that
//! `head == tail` means empty.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::clock::{poll_us, Clock};
use crate::dma::DmaRegion;
use crate::regs::RegisterFile;
use crate::{Error, Result};

/// Free words the ioctl entry throttle waits for
pub const RING_HIGH_MARK: u32 = 128;

/// Smallest ring accepted at init
pub const MIN_RING_WORDS: u32 = 1024;
/// Largest ring accepted at init
pub const MAX_RING_WORDS: u32 = 1 << 20;

/// Packet format consumed by a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    /// PM4 graphics command processor
    Gfx,
    /// Async DMA engine
    Dma,
}

/// Register layout of one ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub base: u32,
    pub cntl: u32,
    pub rptr: u32,
    pub wptr: u32,
    /// Register for the read pointer writeback address, if any
    pub rptr_addr: Option<u32>,
    /// Pointer registers hold `words << ptr_shift`
    pub ptr_shift: u32,
}

/// CPU side of a command ring
pub struct RingBuffer {
    id: usize,
    kind: RingKind,
    mem: Arc<DmaRegion>,
    regs: Arc<dyn RegisterFile>,
    clock: Arc<dyn Clock>,
    layout: RingLayout,
    size: u32,
    mask: u32,
    tail: u32,
    /// Tail at the last reservation, for `undo`
    tail_old: u32,
    /// Cached free words, never more than the true free count
    space: u32,
    high_mark: u32,
    align_mask: u32,
    nop: u32,
    /// Words left in the current reservation
    count_dw: u32,
    head_wb: Option<(Arc<DmaRegion>, usize)>,
    last_rptr: u32,
    last_activity: u64,
    ready: bool,
}

impl RingBuffer {
    /// Wrap `mem` as ring `id`
    ///
    /// The region length is the ring size and must be a power of two.
    pub fn new(
        id: usize,
        kind: RingKind,
        mem: Arc<DmaRegion>,
        regs: Arc<dyn RegisterFile>,
        clock: Arc<dyn Clock>,
        layout: RingLayout,
        align_mask: u32,
        nop: u32,
    ) -> Result<Self> {
        let size = mem.len();
        if !size.is_power_of_two() || size < 2 || size > MAX_RING_WORDS as usize {
            return Err(Error::InvalidArgument("ring size must be a power of two"));
        }
        let size = size as u32;
        if align_mask >= size / 2 || !(align_mask + 1).is_power_of_two() {
            return Err(Error::InvalidArgument("ring alignment"));
        }
        let now = clock.now_us();

        Ok(Self {
            id,
            kind,
            mem,
            regs,
            clock,
            layout,
            size,
            mask: size - 1,
            tail: 0,
            tail_old: 0,
            space: size,
            high_mark: RING_HIGH_MARK.min(size / 2),
            align_mask,
            nop,
            count_dw: 0,
            head_wb: None,
            last_rptr: 0,
            last_activity: now,
            ready: false,
        })
    }

    /// Read the head from word `index` of the writeback page instead of
    /// the read pointer register
    pub fn set_head_writeback(&mut self, wb: Arc<DmaRegion>, index: usize) {
        self.head_wb = Some((wb, index));
    }

    pub fn set_high_mark(&mut self, words: u32) {
        self.high_mark = words.min(self.size - 1);
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn kind(&self) -> RingKind {
        self.kind
    }

    pub fn layout(&self) -> &RingLayout {
        &self.layout
    }

    /// Ring size in words
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Next write index
    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// Cached free words
    pub fn space(&self) -> u32 {
        self.space
    }

    pub fn high_mark(&self) -> u32 {
        self.high_mark
    }

    /// Bus address of the ring memory
    pub fn gpu_addr(&self) -> u64 {
        self.mem.bus_addr()
    }

    /// Shared ring memory
    pub fn memory(&self) -> &Arc<DmaRegion> {
        &self.mem
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    /// Current hardware read pointer in words
    pub fn head(&self) -> u32 {
        let raw = match &self.head_wb {
            Some((wb, index)) => wb.read(*index),
            None => self.regs.read(self.layout.rptr) >> self.layout.ptr_shift,
        };
        raw & self.mask
    }

    /// Words written but not yet consumed by the hardware
    pub fn pending_words(&self) -> u32 {
        self.tail.wrapping_sub(self.head()) & self.mask
    }

    /// Re-read the head and recompute the free word count
    pub fn update_space(&mut self) -> u32 {
        let head = self.head();
        if head != self.last_rptr {
            self.last_rptr = head;
            self.last_activity = self.clock.now_us();
        }
        let free = head.wrapping_sub(self.tail) & self.mask;
        self.space = if free == 0 { self.size } else { free };
        self.space
    }

    /// Wait until more than `n` words are free and claim them
    ///
    /// `n` is rounded up to the fetch alignment. Polls in 1µs steps for at
    /// most `usec_timeout` microseconds.
    pub fn reserve(&mut self, n: u32, usec_timeout: u32) -> Result<()> {
        if !self.ready {
            return Err(Error::RingNotReady { ring: self.id });
        }
        let n = n
            .checked_add(self.align_mask)
            .map(|n| n & !self.align_mask)
            .ok_or(Error::InvalidArgument("ring reservation overflow"))?;
        if n == 0 || n >= self.size {
            return Err(Error::InvalidArgument("ring reservation larger than ring"));
        }
        if self.count_dw != 0 {
            log::warn!(
                "radeon: ring {} reserving {} words with {} unused",
                self.id,
                n,
                self.count_dw
            );
        }

        if self.space <= n {
            let clock = self.clock.clone();
            let ok = poll_us(&*clock, usec_timeout, 1, || (self.update_space() > n).then_some(()));
            if ok.is_none() {
                log::warn!(
                    "radeon: ring {} wait for {} words timed out (space {}, head {}, tail {})",
                    self.id,
                    n,
                    self.space,
                    self.head(),
                    self.tail
                );
                return Err(Error::Busy);
            }
        }

        self.space -= n;
        self.count_dw = n;
        self.tail_old = self.tail;
        Ok(())
    }

    /// Write one word at the tail
    pub fn emit(&mut self, word: u32) {
        if self.count_dw == 0 {
            log::error!("radeon: ring {} writing more words than reserved", self.id);
        } else {
            self.count_dw -= 1;
        }
        self.mem.write(self.tail as usize, word);
        self.tail = (self.tail + 1) & self.mask;
    }

    pub fn emit_slice(&mut self, words: &[u32]) {
        for &word in words {
            self.emit(word);
        }
    }

    /// Publish the tail to the command processor
    pub fn commit(&mut self) {
        while self.tail & self.align_mask != 0 {
            self.emit(self.nop);
        }
        if self.head() == self.tail_old {
            // Ring was idle; progress tracking restarts from here.
            self.last_activity = self.clock.now_us();
        }

        #[cfg(feature = "debug-logging")]
        log::trace!(
            "radeon: ring {} commit {} words, wptr {}",
            self.id,
            self.tail.wrapping_sub(self.tail_old) & self.mask,
            self.tail
        );

        fence(Ordering::SeqCst);
        self.regs
            .write(self.layout.wptr, self.tail << self.layout.ptr_shift);
        // Posting read
        let _ = self.regs.read(self.layout.wptr);
        self.count_dw = 0;
        self.tail_old = self.tail;
    }

    /// Drop everything emitted since the last reservation
    pub fn undo(&mut self) {
        self.tail = self.tail_old;
        self.count_dw = 0;
        self.update_space();
    }

    /// Resynchronize with the hardware read pointer
    ///
    /// Only valid while the engine is idle or freshly reset.
    pub fn reset(&mut self) {
        let rptr = (self.regs.read(self.layout.rptr) >> self.layout.ptr_shift) & self.mask;
        self.regs
            .write(self.layout.wptr, rptr << self.layout.ptr_shift);
        if let Some((wb, index)) = &self.head_wb {
            wb.write(*index, rptr);
        }
        self.tail = rptr;
        self.tail_old = rptr;
        self.count_dw = 0;
        self.space = self.size;
        self.last_rptr = rptr;
        self.last_activity = self.clock.now_us();
        log::debug!("radeon: ring {} reset to {}", self.id, rptr);
    }

    /// Throttle until at least the high-water mark is free
    pub fn wait_high_water(&mut self, usec_timeout: u32) -> Result<()> {
        if self.space >= self.high_mark {
            return Ok(());
        }
        let clock = self.clock.clone();
        let high_mark = self.high_mark;
        poll_us(&*clock, usec_timeout, 1, || {
            (self.update_space() >= high_mark).then_some(())
        })
        .ok_or(Error::Busy)
    }

    /// Whether the read pointer has been stuck for `timeout_us` with words
    /// outstanding
    pub fn test_lockup(&mut self, timeout_us: u64) -> bool {
        let rptr = self.head();
        let now = self.clock.now_us();
        if rptr != self.last_rptr || rptr == self.tail {
            self.last_rptr = rptr;
            self.last_activity = now;
            return false;
        }
        let stalled = now.saturating_sub(self.last_activity);
        if stalled >= timeout_us {
            log::warn!(
                "radeon: ring {} read pointer stuck at {} for {}us",
                self.id,
                rptr,
                stalled
            );
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PACKET2;
    use crate::regs::r100;
    use crate::sim::{ManualClock, RegisterMap};

    fn layout() -> RingLayout {
        RingLayout {
            base: r100::CP_RB_BASE,
            cntl: r100::CP_RB_CNTL,
            rptr: r100::CP_RB_RPTR,
            wptr: r100::CP_RB_WPTR,
            rptr_addr: Some(r100::CP_RB_RPTR_ADDR),
            ptr_shift: 0,
        }
    }

    fn ring(words: usize, align_mask: u32) -> (RingBuffer, Arc<RegisterMap>, Arc<ManualClock>) {
        let regs = Arc::new(RegisterMap::new());
        let clock = Arc::new(ManualClock::new());
        let mem = Arc::new(DmaRegion::new(0x1000, words));
        let mut ring = RingBuffer::new(
            0,
            RingKind::Gfx,
            mem,
            regs.clone(),
            clock.clone(),
            layout(),
            align_mask,
            PACKET2,
        )
        .unwrap();
        ring.set_ready(true);
        (ring, regs, clock)
    }

    #[test]
    fn test_rejects_bad_sizes() {
        let regs = Arc::new(RegisterMap::new());
        let clock = Arc::new(ManualClock::new());
        let mem = Arc::new(DmaRegion::new(0, 1000));
        assert!(RingBuffer::new(0, RingKind::Gfx, mem, regs, clock, layout(), 0, PACKET2).is_err());
    }

    #[test]
    fn test_reserve_emit_commit() {
        let (mut ring, regs, _) = ring(1024, 0);

        ring.reserve(16, 10).unwrap();
        assert_eq!(ring.space(), 1008);
        for i in 0..16 {
            ring.emit(i);
        }
        ring.commit();
        assert_eq!(regs.get(r100::CP_RB_WPTR), 16);
        assert_eq!(ring.memory().read(15), 15);

        // GPU consumes everything.
        regs.set(r100::CP_RB_RPTR, 16);
        ring.reserve(1008, 0).unwrap();
        assert_eq!(ring.space(), 16);
    }

    #[test]
    fn test_reserve_times_out() {
        let (mut ring, _, clock) = ring(1024, 0);

        ring.reserve(1000, 0).unwrap();
        for _ in 0..1000 {
            ring.emit(PACKET2);
        }
        ring.commit();

        assert_eq!(ring.reserve(100, 50), Err(Error::Busy));
        assert_eq!(clock.now_us(), 50);
    }

    #[test]
    fn test_reserve_too_large() {
        let (mut ring, _, _) = ring(1024, 0);
        assert!(matches!(ring.reserve(1024, 10), Err(Error::InvalidArgument(_))));
        assert!(matches!(ring.reserve(0, 10), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_not_ready() {
        let (mut ring, _, _) = ring(1024, 0);
        ring.set_ready(false);
        assert_eq!(ring.reserve(4, 10), Err(Error::RingNotReady { ring: 0 }));
    }

    #[test]
    fn test_space_matches_pointers() {
        let (mut ring, regs, _) = ring(1024, 0);
        let mut head = 0u32;

        for round in 0..200u32 {
            let n = 1 + (round * 37) % 300;
            ring.reserve(n, 0).unwrap();
            for _ in 0..n {
                ring.emit(PACKET2);
            }
            ring.commit();

            let expected = 1024 - (ring.tail().wrapping_sub(head) & 1023);
            assert_eq!(ring.update_space(), expected);

            // GPU catches up every other round.
            if round % 2 == 1 {
                head = ring.tail();
                regs.set(r100::CP_RB_RPTR, head);
            }
        }
    }

    #[test]
    fn test_alignment_padding() {
        let (mut ring, regs, _) = ring(1024, 15);

        ring.reserve(3, 0).unwrap();
        assert_eq!(ring.space(), 1024 - 16);
        ring.emit_slice(&[1, 2, 3]);
        ring.commit();
        assert_eq!(ring.tail(), 16);
        assert_eq!(regs.get(r100::CP_RB_WPTR), 16);
        assert_eq!(ring.memory().read(3), PACKET2);
    }

    #[test]
    fn test_undo() {
        let (mut ring, _, _) = ring(1024, 0);
        ring.reserve(8, 0).unwrap();
        ring.emit_slice(&[1, 2, 3]);
        ring.undo();
        assert_eq!(ring.tail(), 0);
        assert_eq!(ring.space(), 1024);
    }

    #[test]
    fn test_reset_to_read_pointer() {
        let (mut ring, regs, _) = ring(1024, 0);
        ring.reserve(32, 0).unwrap();
        ring.emit_slice(&[0; 32]);
        ring.commit();

        regs.set(r100::CP_RB_RPTR, 20);
        ring.reset();
        assert_eq!(ring.tail(), 20);
        assert_eq!(regs.get(r100::CP_RB_WPTR), 20);
        assert_eq!(ring.update_space(), 1024);
    }

    #[test]
    fn test_head_from_writeback() {
        let (mut ring, regs, _) = ring(1024, 0);
        let wb = Arc::new(DmaRegion::new(0x2000, 64));
        ring.set_head_writeback(wb.clone(), 0);

        ring.reserve(8, 0).unwrap();
        ring.emit_slice(&[0; 8]);
        ring.commit();

        regs.set(r100::CP_RB_RPTR, 8);
        assert_eq!(ring.head(), 0);
        wb.write(0, 8);
        assert_eq!(ring.head(), 8);
        assert_eq!(ring.pending_words(), 0);
    }

    #[test]
    fn test_high_water_throttle() {
        let (mut ring, regs, _) = ring(1024, 0);
        ring.reserve(1000, 0).unwrap();
        ring.emit_slice(&[PACKET2; 1000]);
        ring.commit();

        assert_eq!(ring.wait_high_water(5), Err(Error::Busy));
        regs.set(r100::CP_RB_RPTR, 900);
        assert!(ring.wait_high_water(5).is_ok());
    }

    #[test]
    fn test_lockup_tracking() {
        let (mut ring, regs, clock) = ring(1024, 0);
        ring.reserve(8, 0).unwrap();
        ring.emit_slice(&[0; 8]);
        ring.commit();

        assert!(!ring.test_lockup(1000));
        clock.advance(999);
        assert!(!ring.test_lockup(1000));
        clock.advance(1);
        assert!(ring.test_lockup(1000));

        regs.set(r100::CP_RB_RPTR, 4);
        assert!(!ring.test_lockup(1000));

        // Progress seen while polling for space counts as well.
        clock.advance(1000);
        regs.set(r100::CP_RB_RPTR, 6);
        ring.update_space();
        assert!(!ring.test_lockup(1000));
    }
}
