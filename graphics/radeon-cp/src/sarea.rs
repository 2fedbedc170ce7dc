// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Counters shared with the user-space client
//!
//! The kernel side is the only writer. Clients poll these values for
//! throttling; the hardware copies live in scratch registers and are read
//! back with [`crate::device::Device::last_dispatch`] and friends.

use std::sync::atomic::{AtomicU32, Ordering};

/// Scratch register holding the last completed frame
pub const SCRATCH_LAST_FRAME: u32 = 0;
/// Scratch register holding the last completed buffer age
pub const SCRATCH_LAST_DISPATCH: u32 = 1;
/// Scratch register holding the last completed clear
pub const SCRATCH_LAST_CLEAR: u32 = 2;
/// First scratch register used for ring fences
pub const SCRATCH_FENCE: u32 = 3;

/// One of the client visible age counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Frame,
    Dispatch,
    Clear,
}

impl Counter {
    /// Scratch register the hardware copy is written to
    pub fn scratch(self) -> u32 {
        match self {
            Counter::Frame => SCRATCH_LAST_FRAME,
            Counter::Dispatch => SCRATCH_LAST_DISPATCH,
            Counter::Clear => SCRATCH_LAST_CLEAR,
        }
    }
}

/// Emitted dispatch counters
///
/// Only the hardware lock holder stamps ages, so taking [`Sarea::next`]
/// and later calling [`Sarea::publish`] cannot race with another stamp.
#[derive(Default)]
pub struct Sarea {
    last_frame: AtomicU32,
    last_dispatch: AtomicU32,
    last_clear: AtomicU32,
}

impl Sarea {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, counter: Counter) -> &AtomicU32 {
        match counter {
            Counter::Frame => &self.last_frame,
            Counter::Dispatch => &self.last_dispatch,
            Counter::Clear => &self.last_clear,
        }
    }

    /// Age the next stamp of `counter` will carry, without taking it
    pub fn next(&self, counter: Counter) -> u32 {
        self.counter(counter).load(Ordering::Acquire).wrapping_add(1)
    }

    /// Record `age` as emitted, once its stamp is committed to a ring
    pub fn publish(&self, counter: Counter, age: u32) {
        self.counter(counter).store(age, Ordering::Release);
    }

    pub fn last_dispatch(&self) -> u32 {
        self.last_dispatch.load(Ordering::Acquire)
    }

    pub fn last_clear(&self) -> u32 {
        self.last_clear.load(Ordering::Acquire)
    }

    pub fn last_frame(&self) -> u32 {
        self.last_frame.load(Ordering::Acquire)
    }

    /// Restart all counters, used with a freelist reset
    pub fn reset(&self) {
        self.last_frame.store(0, Ordering::Release);
        self.last_dispatch.store(0, Ordering::Release);
        self.last_clear.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let sarea = Sarea::new();
        assert_eq!(sarea.next(Counter::Dispatch), 1);
        // Nothing moves until the stamp is published.
        assert_eq!(sarea.next(Counter::Dispatch), 1);
        assert_eq!(sarea.last_dispatch(), 0);

        sarea.publish(Counter::Dispatch, 1);
        assert_eq!(sarea.next(Counter::Dispatch), 2);
        sarea.publish(Counter::Clear, sarea.next(Counter::Clear));
        assert_eq!(sarea.last_dispatch(), 1);
        assert_eq!(sarea.last_clear(), 1);
        assert_eq!(sarea.last_frame(), 0);
        assert_eq!(Counter::Frame.scratch(), SCRATCH_LAST_FRAME);

        sarea.reset();
        assert_eq!(sarea.last_dispatch(), 0);
    }
}
