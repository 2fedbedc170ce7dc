// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Ring fences
//!
//! Every ring has a monotonically increasing 64-bit sequence. Emitting a
//! fence appends commands that make the GPU store the low 32 bits of the
//! next sequence to a known location once everything before them has
//! executed. [`FenceDriver::process`] folds the 32-bit hardware value back
//! into 64 bits and wakes waiters when it advances.
//!
//! Waits time out on inactivity rather than on a deadline: as long as the
//! ring keeps completing fences the waiter keeps going. A ring that makes no
//! progress for the lockup window is marked [`RingStatus::LockedUp`]; the
//! first waiter to notice gets [`Error::Lockup`], everybody after that gets
//! [`Error::RingNotReady`] until the ring is reset.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::asic::Asic;
use crate::clock::Clock;
use crate::dma::DmaRegion;
use crate::regs::RegisterFile;
use crate::ring::RingBuffer;
use crate::stats::CpStats;
use crate::{Error, Result};

/// Attempts `process` makes against concurrent updates before giving up
const PROCESS_RETRIES: usize = 10;

const SEQ_HIGH: u64 = 0xffff_ffff_0000_0000;
const SEQ_LOW: u64 = 0x0000_0000_ffff_ffff;

/// Where the GPU stores a ring's completed sequence
#[derive(Clone)]
pub enum FenceLocation {
    /// Scratch register, optionally mirrored into memory by the hardware
    Scratch {
        reg: u32,
        mirror: Option<(Arc<DmaRegion>, usize)>,
    },
    /// Memory word written by an end-of-pipe or DMA fence packet
    Memory { region: Arc<DmaRegion>, index: usize },
}

impl FenceLocation {
    /// Current hardware value
    pub fn read(&self, regs: &dyn RegisterFile) -> u32 {
        match self {
            FenceLocation::Scratch {
                mirror: Some((region, index)),
                ..
            } => region.read(*index),
            FenceLocation::Scratch { reg, mirror: None } => regs.read(*reg),
            FenceLocation::Memory { region, index } => region.read(*index),
        }
    }

    /// Overwrite the hardware value
    pub fn write(&self, regs: &dyn RegisterFile, val: u32) {
        match self {
            FenceLocation::Scratch { reg, mirror } => {
                regs.write(*reg, val);
                if let Some((region, index)) = mirror {
                    region.write(*index, val);
                }
            }
            FenceLocation::Memory { region, index } => region.write(*index, val),
        }
    }

    /// Bus address for memory locations
    pub fn gpu_addr(&self) -> Option<u64> {
        match self {
            FenceLocation::Memory { region, index } => Some(region.addr_of(*index)),
            FenceLocation::Scratch { mirror, .. } => {
                mirror.as_ref().map(|(region, index)| region.addr_of(*index))
            }
        }
    }
}

impl fmt::Debug for FenceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FenceLocation::Scratch { reg, mirror } => f
                .debug_struct("Scratch")
                .field("reg", &format_args!("{:#06x}", reg))
                .field("mirrored", &mirror.is_some())
                .finish(),
            FenceLocation::Memory { region, index } => f
                .debug_struct("Memory")
                .field("addr", &format_args!("{:#x}", region.addr_of(*index)))
                .finish(),
        }
    }
}

/// Ring state as seen by the fence code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingStatus {
    Uninitialized,
    Ready,
    /// No progress within the lockup window, cleared by a reset
    LockedUp,
}

/// Successful wait outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The GPU reached the fence
    Signaled,
    /// The driver is shutting down and completed the fence itself
    ForceCompleted,
}

struct RingFence {
    location: RwLock<Option<FenceLocation>>,
    /// Last completed sequence
    last_seq: AtomicU64,
    /// `sync_seq[self]` is the last emitted sequence, the other entries the
    /// last sequence of that ring this one has already waited for
    sync_seq: Box<[AtomicU64]>,
    /// Clock time of the last observed progress
    last_activity: AtomicU64,
}

struct WaitState {
    status: Vec<RingStatus>,
}

/// Fence bookkeeping for all rings of a device
pub struct FenceDriver {
    regs: Arc<dyn RegisterFile>,
    clock: Arc<dyn Clock>,
    stats: Arc<CpStats>,
    rings: Box<[RingFence]>,
    state: Mutex<WaitState>,
    queue: Condvar,
    shutdown: AtomicBool,
    /// Bumped by `interrupt`
    interrupts: AtomicU64,
    lockup_timeout_us: u64,
    poll_interval: Duration,
}

impl FenceDriver {
    pub fn new(
        regs: Arc<dyn RegisterFile>,
        clock: Arc<dyn Clock>,
        stats: Arc<CpStats>,
        num_rings: usize,
        lockup_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        let rings = (0..num_rings)
            .map(|_| RingFence {
                location: RwLock::new(None),
                last_seq: AtomicU64::new(0),
                sync_seq: (0..num_rings).map(|_| AtomicU64::new(0)).collect(),
                last_activity: AtomicU64::new(0),
            })
            .collect();

        Self {
            regs,
            clock,
            stats,
            rings,
            state: Mutex::new(WaitState {
                status: vec![RingStatus::Uninitialized; num_rings],
            }),
            queue: Condvar::new(),
            shutdown: AtomicBool::new(false),
            interrupts: AtomicU64::new(0),
            lockup_timeout_us: lockup_timeout.as_micros() as u64,
            poll_interval,
        }
    }

    pub fn num_rings(&self) -> usize {
        self.rings.len()
    }

    fn ring(&self, ring: usize) -> Result<&RingFence> {
        self.rings
            .get(ring)
            .ok_or(Error::InvalidArgument("no such ring"))
    }

    fn wake_all(&self) {
        let _state = self.state.lock();
        self.queue.notify_all();
    }

    /// Start tracking `ring` with its hardware write-back location
    ///
    /// The location is seeded with the last completed sequence so a stale
    /// value from before a reset cannot look like progress.
    pub fn init_ring(&self, ring: usize, location: FenceLocation) -> Result<()> {
        let rf = self.ring(ring)?;
        let last = rf.last_seq.load(Ordering::Acquire);
        location.write(&*self.regs, last as u32);
        log::debug!("radeon: fence ring {} at {:?}, seq {:#x}", ring, location, last);

        *rf.location.write() = Some(location);
        rf.last_activity
            .store(self.clock.now_us(), Ordering::Release);

        let mut state = self.state.lock();
        state.status[ring] = RingStatus::Ready;
        self.shutdown.store(false, Ordering::Release);
        Ok(())
    }

    /// Current status of `ring`
    pub fn status(&self, ring: usize) -> RingStatus {
        self.state
            .lock()
            .status
            .get(ring)
            .copied()
            .unwrap_or(RingStatus::Uninitialized)
    }

    pub fn location(&self, ring: usize) -> Option<FenceLocation> {
        self.rings.get(ring)?.location.read().clone()
    }

    /// Emit a fence on `ring`
    ///
    /// The caller holds the hardware lock, has reserved
    /// [`Asic::fence_dw`] words and commits afterwards.
    pub fn emit(self: &Arc<Self>, ring: &mut RingBuffer, asic: &dyn Asic) -> Result<Fence> {
        let id = ring.id();
        let rf = self.ring(id)?;
        match self.status(id) {
            RingStatus::Ready => {}
            RingStatus::LockedUp => return Err(Error::RingNotReady { ring: id }),
            RingStatus::Uninitialized => return Err(Error::NotInitialized),
        }

        let location = rf.location.read();
        let location = location.as_ref().ok_or(Error::NotInitialized)?;
        let prev = rf.sync_seq[id].load(Ordering::Acquire);
        let seq = prev + 1;
        asic.emit_fence(ring, location, seq as u32)?;

        if rf.last_seq.load(Ordering::Acquire) >= prev {
            // Ring was idle, progress is measured from now.
            rf.last_activity
                .store(self.clock.now_us(), Ordering::Release);
        }
        rf.sync_seq[id].store(seq, Ordering::Release);
        self.stats.record_fence_emitted();

        #[cfg(feature = "debug-logging")]
        log::trace!("radeon: ring {} fence {:#x}", id, seq);

        Ok(Fence {
            inner: Arc::new(FenceInner {
                driver: Arc::clone(self),
                ring: id,
                seq,
            }),
        })
    }

    /// Fold the hardware value into `last_seq`, returns whether it advanced
    pub fn process(&self, ring: usize) -> bool {
        let Some(rf) = self.rings.get(ring) else {
            return false;
        };
        let location = rf.location.read();
        let Some(location) = location.as_ref() else {
            return false;
        };

        let mut last_seq = rf.last_seq.load(Ordering::Acquire);
        let mut advanced = None;
        for _ in 0..PROCESS_RETRIES {
            let last_emitted = rf.sync_seq[ring].load(Ordering::Acquire);
            let hw = u64::from(location.read(&*self.regs));
            let mut seq = hw | (last_seq & SEQ_HIGH);
            if seq < last_seq {
                // The 32-bit counter wrapped; the completion cannot be ahead
                // of the last emission, so take its upper half.
                seq = (seq & SEQ_LOW) | (last_emitted & SEQ_HIGH);
            }
            if seq <= last_seq || seq > last_emitted {
                break;
            }
            match rf
                .last_seq
                .compare_exchange(last_seq, seq, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    advanced = Some(seq);
                    break;
                }
                Err(current) => last_seq = current,
            }
        }

        match advanced {
            Some(seq) => {
                rf.last_activity
                    .store(self.clock.now_us(), Ordering::Release);
                self.stats.record_fences_signaled(seq - last_seq);
                self.wake_all();
                true
            }
            None => false,
        }
    }

    /// Whether `ring` completed `seq`
    pub fn signaled(&self, ring: usize, seq: u64) -> bool {
        let Some(rf) = self.rings.get(ring) else {
            return false;
        };
        if rf.last_seq.load(Ordering::Acquire) >= seq {
            return true;
        }
        self.process(ring);
        rf.last_seq.load(Ordering::Acquire) >= seq
    }

    /// Last completed sequence
    pub fn last_seq(&self, ring: usize) -> u64 {
        self.rings
            .get(ring)
            .map_or(0, |rf| rf.last_seq.load(Ordering::Acquire))
    }

    /// Last emitted sequence
    pub fn last_emitted(&self, ring: usize) -> u64 {
        self.rings
            .get(ring)
            .map_or(0, |rf| rf.sync_seq[ring].load(Ordering::Acquire))
    }

    /// Fences emitted but not yet completed
    pub fn count_emitted(&self, ring: usize) -> u64 {
        self.process(ring);
        self.last_emitted(ring)
            .saturating_sub(self.last_seq(ring))
    }

    /// Block until the targets complete
    ///
    /// With `any` set the first completed target ends the wait, otherwise
    /// all of them must complete.
    fn wait_seqs(&self, targets: &[(usize, u64)], any: bool, interruptible: bool) -> Result<WaitStatus> {
        for &(ring, _) in targets {
            self.ring(ring)?;
        }
        let epoch = self.interrupts.load(Ordering::Acquire);

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Ok(WaitStatus::ForceCompleted);
            }

            let pending: Vec<(usize, u64)> = targets
                .iter()
                .copied()
                .filter(|&(ring, seq)| !self.signaled(ring, seq))
                .collect();
            if pending.is_empty() || (any && pending.len() < targets.len()) {
                if self.shutdown.load(Ordering::Acquire) {
                    return Ok(WaitStatus::ForceCompleted);
                }
                return Ok(WaitStatus::Signaled);
            }

            // Lockup is judged on the ring that has been quiet the longest.
            let (ring, seq, activity) = pending
                .iter()
                .map(|&(ring, seq)| {
                    (ring, seq, self.rings[ring].last_activity.load(Ordering::Acquire))
                })
                .min_by_key(|&(_, _, activity)| activity)
                .unwrap_or((0, 0, 0));
            let idle = self.clock.now_us().saturating_sub(activity);

            let mut state = self.state.lock();
            if self.shutdown.load(Ordering::Acquire) {
                return Ok(WaitStatus::ForceCompleted);
            }
            for &(ring, _) in &pending {
                match state.status[ring] {
                    RingStatus::Ready => {}
                    RingStatus::LockedUp => return Err(Error::RingNotReady { ring }),
                    RingStatus::Uninitialized => return Err(Error::NotInitialized),
                }
            }
            if interruptible && self.interrupts.load(Ordering::Acquire) != epoch {
                return Err(Error::Interrupted);
            }

            if idle >= self.lockup_timeout_us {
                if self.rings[ring].last_activity.load(Ordering::Acquire) != activity {
                    // Another caller saw progress meanwhile.
                    continue;
                }
                state.status[ring] = RingStatus::LockedUp;
                drop(state);
                return Err(self.locked_up(ring, seq));
            }

            // Completion may have landed between the check above and taking
            // the lock; `process` wakes under the lock, so this is race free.
            if pending
                .iter()
                .any(|&(ring, seq)| self.rings[ring].last_seq.load(Ordering::Acquire) >= seq)
            {
                continue;
            }

            let remaining = Duration::from_micros((self.lockup_timeout_us - idle).max(1));
            let _ = self
                .queue
                .wait_for(&mut state, self.poll_interval.min(remaining));
        }
    }

    /// Account a freshly detected lockup and release everyone waiting on
    /// the ring
    fn locked_up(&self, ring: usize, seq: u64) -> Error {
        self.stats.record_lockup();
        log::warn!(
            "radeon: GPU lockup on ring {}, waiting for {:#x}, last signaled {:#x}, last emitted {:#x}",
            ring,
            seq,
            self.last_seq(ring),
            self.last_emitted(ring)
        );
        self.wake_all();
        Error::Lockup { ring, seq }
    }

    /// Mark `ring` locked up on evidence found outside a fence wait, such
    /// as a read pointer that stopped moving
    ///
    /// Returns the error for the caller to hand on: [`Error::Lockup`] for
    /// the first report, [`Error::RingNotReady`] if the ring was already
    /// given up on.
    pub fn report_lockup(&self, ring: usize) -> Error {
        let mut state = self.state.lock();
        match state.status.get(ring) {
            Some(RingStatus::Ready) => {}
            Some(RingStatus::LockedUp) => return Error::RingNotReady { ring },
            _ => return Error::NotInitialized,
        }
        state.status[ring] = RingStatus::LockedUp;
        drop(state);
        self.locked_up(ring, self.last_seq(ring) + 1)
    }

    /// Wait for one fence
    pub fn wait(&self, fence: &Fence, interruptible: bool) -> Result<WaitStatus> {
        self.wait_seqs(&[(fence.ring(), fence.seq())], false, interruptible)
    }

    /// Wait for sequence `seq` of `ring` without holding a [`Fence`]
    pub fn wait_seq(&self, ring: usize, seq: u64, interruptible: bool) -> Result<WaitStatus> {
        if seq > self.last_emitted(ring) {
            return Err(Error::InvalidArgument("sequence not emitted"));
        }
        self.wait_seqs(&[(ring, seq)], false, interruptible)
    }

    /// Wait until any of `fences` completes
    pub fn wait_any(&self, fences: &[Fence], interruptible: bool) -> Result<WaitStatus> {
        if fences.is_empty() {
            return Err(Error::InvalidArgument("no fences to wait for"));
        }
        let targets: Vec<(usize, u64)> = fences.iter().map(|f| (f.ring(), f.seq())).collect();
        self.wait_seqs(&targets, true, interruptible)
    }

    /// Wait for the oldest outstanding fence of `ring`
    pub fn wait_next(&self, ring: usize) -> Result<WaitStatus> {
        self.process(ring);
        let seq = self.last_seq(ring) + 1;
        if seq > self.last_emitted(ring) {
            return Ok(WaitStatus::Signaled);
        }
        self.wait_seqs(&[(ring, seq)], false, false)
    }

    /// Wait for every fence emitted on `ring`
    pub fn wait_empty(&self, ring: usize) -> Result<WaitStatus> {
        let seq = self.last_emitted(ring);
        if seq == 0 {
            return Ok(WaitStatus::Signaled);
        }
        self.wait_seqs(&[(ring, seq)], false, false)
    }

    /// Whether `dst` must wait for `fence` before consuming its results
    pub fn need_sync(&self, fence: Option<&Fence>, dst: usize) -> bool {
        let Some(fence) = fence else {
            return false;
        };
        if fence.ring() == dst {
            return false;
        }
        let Some(rf) = self.rings.get(dst) else {
            return false;
        };
        fence.seq() > rf.sync_seq[fence.ring()].load(Ordering::Acquire)
    }

    /// Record that `dst` waited for `fence`, including everything the
    /// fence's ring had itself waited for
    pub fn note_sync(&self, fence: Option<&Fence>, dst: usize) {
        let Some(fence) = fence else {
            return;
        };
        if fence.ring() == dst {
            return;
        }
        let (Some(src), Some(dst_ring)) = (self.rings.get(fence.ring()), self.rings.get(dst)) else {
            return;
        };
        for (i, seq) in src.sync_seq.iter().enumerate() {
            if i != dst {
                dst_ring.sync_seq[i].fetch_max(seq.load(Ordering::Acquire), Ordering::AcqRel);
            }
        }
    }

    /// Make interruptible waiters return [`Error::Interrupted`]
    pub fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::AcqRel);
        self.wake_all();
    }

    /// Write the last emitted sequence of `ring` to its hardware location
    fn complete_location(&self, ring: usize) {
        let rf = &self.rings[ring];
        if let Some(location) = rf.location.read().as_ref() {
            let seq = rf.sync_seq[ring].load(Ordering::Acquire);
            location.write(&*self.regs, seq as u32);
        }
        self.process(ring);
    }

    /// Treat every emitted fence of `ring` as done, used when a reset
    /// threw the work away
    pub fn complete_ring(&self, ring: usize) -> Result<()> {
        self.ring(ring)?;
        self.complete_location(ring);
        Ok(())
    }

    /// Clear a lockup so `ring` accepts work again
    pub fn reset_ring(&self, ring: usize) -> Result<()> {
        let rf = self.ring(ring)?;
        let mut state = self.state.lock();
        if state.status[ring] == RingStatus::Uninitialized {
            return Err(Error::NotInitialized);
        }
        state.status[ring] = RingStatus::Ready;
        rf.last_activity
            .store(self.clock.now_us(), Ordering::Release);
        Ok(())
    }

    /// Complete every outstanding fence and release all waiters with
    /// [`WaitStatus::ForceCompleted`]
    pub fn force_completion(&self) {
        self.shutdown.store(true, Ordering::Release);
        for ring in 0..self.rings.len() {
            self.complete_location(ring);
        }
        self.wake_all();
        log::info!("radeon: fences force completed");
    }

    /// Force completion and stop tracking all rings
    pub fn fini(&self) {
        self.force_completion();
        for rf in self.rings.iter() {
            *rf.location.write() = None;
        }
        let mut state = self.state.lock();
        for status in state.status.iter_mut() {
            *status = RingStatus::Uninitialized;
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

struct FenceInner {
    driver: Arc<FenceDriver>,
    ring: usize,
    seq: u64,
}

/// Reference-counted handle to one emitted fence
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    pub fn ring(&self) -> usize {
        self.inner.ring
    }

    pub fn seq(&self) -> u64 {
        self.inner.seq
    }

    pub fn signaled(&self) -> bool {
        self.inner.driver.signaled(self.inner.ring, self.inner.seq)
    }

    pub fn wait(&self, interruptible: bool) -> Result<WaitStatus> {
        self.inner.driver.wait(self, interruptible)
    }
}

impl PartialEq for Fence {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner.driver, &other.inner.driver)
            && self.inner.ring == other.inner.ring
            && self.inner.seq == other.inner.seq
    }
}

impl Eq for Fence {}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("ring", &self.inner.ring)
            .field("seq", &self.inner.seq)
            .finish()
    }
}
