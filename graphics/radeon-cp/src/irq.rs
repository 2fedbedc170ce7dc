// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Interrupt event queue
//!
//! The interrupt handler (or the simulator) pushes events here and the
//! driver drains them in [`crate::device::Device::service_interrupts`].

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

/// What raised an interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqSource {
    /// A fence or trap on ring `n` completed
    Ring(usize),
    /// Anything else, with the raw status bits
    Other(u32),
}

/// Bounded interrupt event queue
pub struct IrqLine {
    events: ArrayQueue<IrqSource>,
    dropped: AtomicU64,
}

impl IrqLine {
    pub fn new(depth: usize) -> Self {
        Self {
            events: ArrayQueue::new(depth.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Record an interrupt, dropping it if the queue is full
    ///
    /// Dropped ring events are harmless since fence waits also poll.
    pub fn raise(&self, source: IrqSource) {
        if self.events.push(source).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn pop(&self) -> Option<IrqSource> {
        self.events.pop()
    }

    /// Take every pending event
    pub fn drain(&self) -> Vec<IrqSource> {
        let mut events = Vec::with_capacity(self.events.len());
        while let Some(event) = self.events.pop() {
            events.push(event);
        }
        events
    }

    pub fn pending(&self) -> usize {
        self.events.len()
    }

    /// Events lost to a full queue
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_counts_drops() {
        let line = IrqLine::new(2);
        line.raise(IrqSource::Ring(0));
        line.raise(IrqSource::Ring(1));
        line.raise(IrqSource::Other(4));
        assert_eq!(line.pending(), 2);
        assert_eq!(line.dropped(), 1);
        assert_eq!(line.drain(), vec![IrqSource::Ring(0), IrqSource::Ring(1)]);
        assert_eq!(line.pop(), None);
    }
}
