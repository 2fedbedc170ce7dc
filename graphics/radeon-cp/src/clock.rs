// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Time source and bounded busy polling

use std::time::{Duration, Instant};

/// Microsecond time source
pub trait Clock: Send + Sync {
    /// Monotonic microseconds since an arbitrary origin
    fn now_us(&self) -> u64;

    /// Busy-wait for `us` microseconds
    fn udelay(&self, us: u32);
}

/// Wall clock backed by [`Instant`]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn udelay(&self, us: u32) {
        let deadline = Instant::now() + Duration::from_micros(u64::from(us));
        while Instant::now() < deadline {
            core::hint::spin_loop();
        }
    }
}

/// Poll `check` every `step_us` until it yields a value or `budget_us`
/// polls have elapsed.
///
/// The first check happens immediately. Returns `None` when the budget is
/// exhausted; the caller decides whether that is worth retrying.
pub fn poll_us<T>(
    clock: &dyn Clock,
    budget_us: u32,
    step_us: u32,
    mut check: impl FnMut() -> Option<T>,
) -> Option<T> {
    let step = step_us.max(1);
    let mut waited = 0u32;
    loop {
        if let Some(val) = check() {
            return Some(val);
        }
        if waited >= budget_us {
            return None;
        }
        clock.udelay(step);
        waited = waited.saturating_add(step);
    }
}
