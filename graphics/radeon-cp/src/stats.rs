// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Command processor counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the ring, freelist and fence code
pub struct CpStats {
    // Freelist
    buffers_requested: AtomicU64,
    freelist_loops: AtomicU64,
    freelist_timeouts: AtomicU64,

    // Ring
    submissions: AtomicU64,
    words_committed: AtomicU64,
    ring_waits: AtomicU64,
    ring_timeouts: AtomicU64,

    // Fences
    fences_emitted: AtomicU64,
    fences_signaled: AtomicU64,
    lockups: AtomicU64,
    interrupts: AtomicU64,
    engine_resets: AtomicU64,
}

/// Point-in-time copy of [`CpStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub buffers_requested: u64,
    pub freelist_loops: u64,
    pub freelist_timeouts: u64,
    pub submissions: u64,
    pub words_committed: u64,
    pub ring_waits: u64,
    pub ring_timeouts: u64,
    pub fences_emitted: u64,
    pub fences_signaled: u64,
    pub lockups: u64,
    pub interrupts: u64,
    pub engine_resets: u64,
}

impl CpStats {
    pub const fn new() -> Self {
        Self {
            buffers_requested: AtomicU64::new(0),
            freelist_loops: AtomicU64::new(0),
            freelist_timeouts: AtomicU64::new(0),
            submissions: AtomicU64::new(0),
            words_committed: AtomicU64::new(0),
            ring_waits: AtomicU64::new(0),
            ring_timeouts: AtomicU64::new(0),
            fences_emitted: AtomicU64::new(0),
            fences_signaled: AtomicU64::new(0),
            lockups: AtomicU64::new(0),
            interrupts: AtomicU64::new(0),
            engine_resets: AtomicU64::new(0),
        }
    }

    pub fn record_buffer_request(&self) {
        self.buffers_requested.fetch_add(1, Ordering::Relaxed);
    }

    /// A freelist acquire had to poll the hardware age
    pub fn record_freelist_loop(&self) {
        self.freelist_loops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_freelist_timeout(&self) {
        self.freelist_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_submission(&self, words: u32) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
        self.words_committed
            .fetch_add(u64::from(words), Ordering::Relaxed);
    }

    /// A reservation found the ring full
    pub fn record_ring_wait(&self) {
        self.ring_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ring_timeout(&self) {
        self.ring_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fence_emitted(&self) {
        self.fences_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// `count` sequence numbers completed in one step
    pub fn record_fences_signaled(&self, count: u64) {
        self.fences_signaled.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_lockup(&self) {
        self.lockups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_engine_reset(&self) {
        self.engine_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            buffers_requested: self.buffers_requested.load(Ordering::Relaxed),
            freelist_loops: self.freelist_loops.load(Ordering::Relaxed),
            freelist_timeouts: self.freelist_timeouts.load(Ordering::Relaxed),
            submissions: self.submissions.load(Ordering::Relaxed),
            words_committed: self.words_committed.load(Ordering::Relaxed),
            ring_waits: self.ring_waits.load(Ordering::Relaxed),
            ring_timeouts: self.ring_timeouts.load(Ordering::Relaxed),
            fences_emitted: self.fences_emitted.load(Ordering::Relaxed),
            fences_signaled: self.fences_signaled.load(Ordering::Relaxed),
            lockups: self.lockups.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            engine_resets: self.engine_resets.load(Ordering::Relaxed),
        }
    }
}

impl Default for CpStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = CpStats::new();
        stats.record_submission(16);
        stats.record_submission(32);
        stats.record_fences_signaled(3);
        stats.record_lockup();

        let snap = stats.snapshot();
        assert_eq!(snap.submissions, 2);
        assert_eq!(snap.words_committed, 48);
        assert_eq!(snap.fences_signaled, 3);
        assert_eq!(snap.lockups, 1);
        assert_eq!(snap.interrupts, 0);
    }
}
