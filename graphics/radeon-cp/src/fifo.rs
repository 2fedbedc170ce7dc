// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Hardware FIFO and engine idle waits
//!
//! These never retry past their own budget; a `Busy` result goes back to the
//! caller, which decides whether to reset the engine.

use crate::asic::Asic;
use crate::clock::{poll_us, Clock};
use crate::regs::RegisterFile;
use crate::{Error, Result};

/// Wait until at least `slots` entries of the command FIFO are free
pub fn wait_for_fifo_slots(
    regs: &dyn RegisterFile,
    asic: &dyn Asic,
    clock: &dyn Clock,
    slots: u32,
    usec_timeout: u32,
) -> Result<()> {
    poll_us(clock, usec_timeout, 1, || {
        (asic.fifo_slots(regs) >= slots).then_some(())
    })
    .ok_or_else(|| {
        log::warn!(
            "radeon: FIFO wait for {} slots failed, {} free",
            slots,
            asic.fifo_slots(regs)
        );
        Error::Busy
    })
}

/// Flush the pixel cache and wait for the flush to land
pub fn flush_pixel_cache(
    regs: &dyn RegisterFile,
    asic: &dyn Asic,
    clock: &dyn Clock,
    usec_timeout: u32,
) -> Result<()> {
    asic.flush_caches(regs);
    poll_us(clock, usec_timeout, 1, || (!asic.caches_busy(regs)).then_some(()))
        .ok_or_else(|| {
            log::warn!("radeon: pixel cache flush timed out");
            Error::Busy
        })
}

/// Wait for the FIFO to drain and the engines to go idle, then flush the
/// pixel cache
pub fn wait_for_idle(
    regs: &dyn RegisterFile,
    asic: &dyn Asic,
    clock: &dyn Clock,
    usec_timeout: u32,
) -> Result<()> {
    wait_for_fifo_slots(regs, asic, clock, asic.fifo_depth(), usec_timeout)?;

    poll_us(clock, usec_timeout, 1, || (!asic.engine_busy(regs)).then_some(()))
        .ok_or_else(|| {
            log::warn!("radeon: engine still active after {}us", usec_timeout);
            Error::Busy
        })?;

    flush_pixel_cache(regs, asic, clock, usec_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asic::R100;
    use crate::regs::{r100, RbbmStatus};
    use crate::sim::{ManualClock, RegisterMap};

    #[test]
    fn test_fifo_slots() {
        let regs = RegisterMap::new();
        let clock = ManualClock::new();

        regs.set(r100::RBBM_STATUS, 8);
        assert!(wait_for_fifo_slots(&regs, &R100, &clock, 8, 100).is_ok());
        assert_eq!(clock.now_us(), 0);

        assert_eq!(wait_for_fifo_slots(&regs, &R100, &clock, 64, 100), Err(Error::Busy));
        assert_eq!(clock.now_us(), 100);
    }

    #[test]
    fn test_idle_flushes_cache() {
        let regs = RegisterMap::new();
        let clock = ManualClock::new();

        regs.set(r100::RBBM_STATUS, r100::FIFO_DEPTH);
        assert!(wait_for_idle(&regs, &R100, &clock, 10).is_ok());
        assert_eq!(
            regs.get(r100::RB3D_DSTCACHE_CTLSTAT) & r100::RB3D_DC_FLUSH_ALL,
            r100::RB3D_DC_FLUSH_ALL
        );
    }

    #[test]
    fn test_idle_times_out_while_active() {
        let regs = RegisterMap::new();
        let clock = ManualClock::new();

        regs.set(
            r100::RBBM_STATUS,
            r100::FIFO_DEPTH | RbbmStatus::ACTIVE.bits(),
        );
        assert_eq!(wait_for_idle(&regs, &R100, &clock, 10), Err(Error::Busy));
        assert_eq!(regs.get(r100::RB3D_DSTCACHE_CTLSTAT), 0);
    }

    #[test]
    fn test_cache_flush_timeout() {
        let regs = RegisterMap::new();
        let clock = ManualClock::new();

        regs.set(r100::RBBM_STATUS, r100::FIFO_DEPTH);
        regs.set(r100::RB3D_DSTCACHE_CTLSTAT, r100::RB3D_DC_BUSY);
        assert_eq!(wait_for_idle(&regs, &R100, &clock, 10), Err(Error::Busy));
    }
}
