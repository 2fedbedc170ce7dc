// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Register window access
//!
//! Every component that touches the hardware receives a [`RegisterFile`]
//! rather than a raw BAR pointer, so the command processor logic runs
//! unchanged against [`Mmio`] or the simulator in [`crate::sim`].

use bitflags::bitflags;

/// PLL index/data pair
pub const CLOCK_CNTL_INDEX: u32 = 0x0008;
pub const CLOCK_CNTL_DATA: u32 = 0x000c;
pub const PLL_WR_EN: u32 = 1 << 7;
pub const PLL_INDEX_MASK: u32 = 0x3f;

/// PLL registers (indices, not offsets)
pub mod pll {
    pub const MCLK_CNTL: u32 = 0x12;
    pub const FORCEON_MCLKA: u32 = 1 << 16;
    pub const FORCEON_MCLKB: u32 = 1 << 17;
    pub const FORCEON_YCLKA: u32 = 1 << 18;
    pub const FORCEON_YCLKB: u32 = 1 << 19;
    pub const FORCEON_MC: u32 = 1 << 20;
    pub const FORCEON_AIC: u32 = 1 << 21;
}

/// R100-R500 command processor and 2D/3D engine registers
pub mod r100 {
    pub const GEN_INT_CNTL: u32 = 0x0040;
    pub const GEN_INT_STATUS: u32 = 0x0044;
    pub const SW_INT_ENABLE: u32 = 1 << 25;
    pub const SW_INT_TEST: u32 = 1 << 25;
    pub const SW_INT_FIRE: u32 = 1 << 26;

    pub const RBBM_SOFT_RESET: u32 = 0x00f0;
    pub const SOFT_RESET_CP: u32 = 1 << 0;
    pub const SOFT_RESET_HI: u32 = 1 << 1;
    pub const SOFT_RESET_SE: u32 = 1 << 2;
    pub const SOFT_RESET_RE: u32 = 1 << 3;
    pub const SOFT_RESET_PP: u32 = 1 << 4;
    pub const SOFT_RESET_E2: u32 = 1 << 5;
    pub const SOFT_RESET_RB: u32 = 1 << 6;

    pub const CP_RB_BASE: u32 = 0x0700;
    pub const CP_RB_CNTL: u32 = 0x0704;
    pub const RB_NO_UPDATE: u32 = 1 << 27;
    pub const CP_RB_RPTR_ADDR: u32 = 0x070c;
    pub const CP_RB_RPTR: u32 = 0x0710;
    pub const CP_RB_WPTR: u32 = 0x0714;
    pub const CP_IB_BASE: u32 = 0x0738;
    pub const CP_IB_BUFSZ: u32 = 0x073c;
    pub const CP_CSQ_CNTL: u32 = 0x0740;
    pub const CSQ_PRIDIS_INDDIS: u32 = 0 << 28;
    pub const CSQ_PRIBM_INDBM: u32 = 4 << 28;

    pub const SCRATCH_UMSK: u32 = 0x0770;
    pub const SCRATCH_ADDR: u32 = 0x0774;
    pub const SCRATCH_REG0: u32 = 0x15e0;
    pub const NUM_SCRATCH: u32 = 6;

    pub const RBBM_STATUS: u32 = 0x0e40;
    /// Hardware command FIFO depth
    pub const FIFO_DEPTH: u32 = 64;

    pub const WAIT_UNTIL: u32 = 0x1720;
    pub const WAIT_2D_IDLECLEAN: u32 = 1 << 16;
    pub const WAIT_3D_IDLECLEAN: u32 = 1 << 17;
    pub const WAIT_HOST_IDLECLEAN: u32 = 1 << 18;
    pub const ISYNC_CNTL: u32 = 0x1724;

    pub const RB3D_DSTCACHE_CTLSTAT: u32 = 0x325c;
    pub const RB3D_DC_FLUSH_ALL: u32 = 0xf;
    pub const RB3D_DC_BUSY: u32 = 1 << 31;
    pub const RB3D_ZCACHE_CTLSTAT: u32 = 0x3254;
    pub const RB3D_ZC_FLUSH_ALL: u32 = 0x3;

    /// 2D engine state used by the front-end
    pub const DP_GUI_MASTER_CNTL: u32 = 0x146c;
    pub const DP_WRITE_MASK: u32 = 0x16cc;
    pub const DST_PITCH_OFFSET: u32 = 0x142c;
    pub const SRC_PITCH_OFFSET: u32 = 0x1428;
    pub const RB3D_DEPTHCLEARVALUE: u32 = 0x3230;
    pub const SE_VTX_FMT: u32 = 0x2080;
}

/// R600 command processor, DMA engine and status registers
pub mod r600 {
    pub const GRBM_STATUS: u32 = 0x8010;
    pub const GRBM_SOFT_RESET: u32 = 0x8020;
    pub const SOFT_RESET_CP: u32 = 1 << 0;

    pub const SCRATCH_REG0: u32 = 0x8500;
    pub const SCRATCH_UMSK: u32 = 0x8540;
    pub const SCRATCH_ADDR: u32 = 0x8544;
    pub const NUM_SCRATCH: u32 = 7;

    pub const CP_COHER_CNTL: u32 = 0x85f0;
    pub const CP_COHER_STATUS: u32 = 0x85fc;
    pub const COHER_STATUS_BUSY: u32 = 1 << 31;
    pub const CP_ME_CNTL: u32 = 0x86d8;
    pub const CP_ME_HALT: u32 = 1 << 28;
    pub const CP_PFP_HALT: u32 = 1 << 26;
    pub const CP_RB_RPTR: u32 = 0x8700;

    pub const CP_RB_BASE: u32 = 0xc100;
    pub const CP_RB_CNTL: u32 = 0xc104;
    pub const CP_RB_WPTR: u32 = 0xc114;
    pub const CP_INT_CNTL: u32 = 0xc124;
    pub const CP_INT_STATUS: u32 = 0xc128;
    pub const RB_INT_ENABLE: u32 = 1 << 27;

    pub const DMA_RB_CNTL: u32 = 0xd000;
    pub const DMA_RB_ENABLE: u32 = 1 << 0;
    pub const DMA_RB_BASE: u32 = 0xd004;
    pub const DMA_RB_RPTR: u32 = 0xd008;
    pub const DMA_RB_WPTR: u32 = 0xd00c;
    pub const DMA_STATUS_REG: u32 = 0xd034;
    pub const DMA_IDLE: u32 = 1 << 0;

    /// Hardware command FIFO depth
    pub const FIFO_DEPTH: u32 = 16;
}

bitflags! {
    /// R100 `RBBM_STATUS`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RbbmStatus: u32 {
        const FIFOCNT = 0x7f;
        const CP_CMDSTRM_BUSY = 1 << 16;
        const E2_BUSY = 1 << 17;
        const RB2D_BUSY = 1 << 18;
        const RB3D_BUSY = 1 << 19;
        const ACTIVE = 1 << 31;
    }
}

impl RbbmStatus {
    /// Free FIFO entries
    pub fn fifo_slots(self) -> u32 {
        self.bits() & Self::FIFOCNT.bits()
    }
}

bitflags! {
    /// R600 `GRBM_STATUS`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GrbmStatus: u32 {
        const CMDFIFO_AVAIL = 0x1f;
        const CP_RQ_PENDING = 1 << 6;
        const CF_RQ_PENDING = 1 << 7;
        const CP_COHERENCY_BUSY = 1 << 28;
        const CP_BUSY = 1 << 29;
        const GUI_ACTIVE = 1 << 31;
    }
}

impl GrbmStatus {
    /// Free FIFO entries
    pub fn fifo_slots(self) -> u32 {
        self.bits() & Self::CMDFIFO_AVAIL.bits()
    }
}

bitflags! {
    /// Buffers touched by a clear request
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ClearFlags: u32 {
        const FRONT = 1 << 0;
        const BACK = 1 << 1;
        const DEPTH = 1 << 2;
        const STENCIL = 1 << 3;
    }
}

/// 32-bit register window of one device
pub trait RegisterFile: Send + Sync {
    /// Read a register
    fn read(&self, reg: u32) -> u32;

    /// Write a register
    fn write(&self, reg: u32, val: u32);

    /// Read-modify-write
    fn modify(&self, reg: u32, clear: u32, set: u32) {
        let val = self.read(reg);
        self.write(reg, (val & !clear) | set);
    }

    /// Read an indirect PLL register
    fn read_pll(&self, index: u32) -> u32 {
        self.write(CLOCK_CNTL_INDEX, index & PLL_INDEX_MASK);
        self.read(CLOCK_CNTL_DATA)
    }

    /// Write an indirect PLL register
    fn write_pll(&self, index: u32, val: u32) {
        self.write(CLOCK_CNTL_INDEX, (index & PLL_INDEX_MASK) | PLL_WR_EN);
        self.write(CLOCK_CNTL_DATA, val);
    }
}

/// Memory-mapped register BAR
pub struct Mmio {
    base: *mut u32,
    len: usize,
}

impl Mmio {
    /// Wrap a mapped register BAR
    ///
    /// # Safety
    ///
    /// `base` must point to `len` bytes of device registers that stay mapped
    /// for the lifetime of the returned value.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        Self {
            base: base as *mut u32,
            len,
        }
    }

    fn slot(&self, reg: u32) -> Option<*mut u32> {
        let reg = reg as usize;
        if reg % 4 != 0 || reg + 4 > self.len {
            return None;
        }
        // In bounds of the mapping checked above.
        Some(unsafe { self.base.add(reg / 4) })
    }
}

impl RegisterFile for Mmio {
    fn read(&self, reg: u32) -> u32 {
        match self.slot(reg) {
            Some(ptr) => unsafe { core::ptr::read_volatile(ptr) },
            None => {
                log::error!("radeon: register read out of window: {:#06x}", reg);
                0xffff_ffff
            }
        }
    }

    fn write(&self, reg: u32, val: u32) {
        match self.slot(reg) {
            Some(ptr) => unsafe { core::ptr::write_volatile(ptr, val) },
            None => log::error!("radeon: register write out of window: {:#06x}", reg),
        }
    }
}

unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}
