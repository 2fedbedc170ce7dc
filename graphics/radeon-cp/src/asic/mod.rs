// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Per-generation command processor programming
//!
//! Everything that differs between chip generations (ring registers, fence
//! and semaphore packets, status decoding, reset sequences) sits behind
//! [`Asic`]. The implementation is picked once from the configured
//! [`Family`] and held as a trait object.

mod r100;
mod r600;

pub use r100::R100;
pub use r600::R600;

use crate::clock::Clock;
use crate::config::Family;
use crate::fence::FenceLocation;
use crate::regs::RegisterFile;
use crate::ring::{RingBuffer, RingKind, RingLayout};
use crate::Result;

/// Graphics ring index on every generation
pub const GFX_RING: usize = 0;
/// Async DMA ring index where one exists
pub const DMA_RING: usize = 1;

/// Static description of one ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingDesc {
    pub kind: RingKind,
    pub layout: RingLayout,
    /// Fetch alignment minus one, in words
    pub align_mask: u32,
    /// Filler word used for padding
    pub nop: u32,
}

/// Chip generation operations
pub trait Asic: Send + Sync {
    fn family(&self) -> Family;

    fn name(&self) -> &'static str;

    /// Number of command rings
    fn num_rings(&self) -> usize;

    fn ring_desc(&self, ring: usize) -> RingDesc;

    /// Whether the fixed-function 2D/3D packets (`PAINT_MULTI`,
    /// `BITBLT_MULTI`, `RNDR_GEN_INDX_PRIM`) and their setup registers exist
    fn legacy_render(&self) -> bool;

    /// Hardware command FIFO depth
    fn fifo_depth(&self) -> u32;

    /// Free hardware FIFO entries
    fn fifo_slots(&self, regs: &dyn RegisterFile) -> u32;

    /// Whether any engine is still executing
    fn engine_busy(&self, regs: &dyn RegisterFile) -> bool;

    /// Start a pixel/Z cache flush
    fn flush_caches(&self, regs: &dyn RegisterFile);

    /// Whether the cache flush is still running
    fn caches_busy(&self, regs: &dyn RegisterFile) -> bool;

    /// Register offset of scratch register `index`
    fn scratch_reg(&self, index: u32) -> u32;

    fn num_scratch(&self) -> u32;

    /// Mirror scratch registers into memory at `addr`, or stop mirroring
    fn scratch_writeback(&self, regs: &dyn RegisterFile, addr: Option<u64>);

    /// Program ring base, size and read pointer writeback
    fn ring_start(&self, regs: &dyn RegisterFile, ring: &RingBuffer, rptr_wb: Option<u64>);

    /// Let the command processor fetch
    fn cp_start(&self, regs: &dyn RegisterFile);

    /// Halt fetching
    fn cp_stop(&self, regs: &dyn RegisterFile);

    /// Soft reset of the command processor and the drawing engines
    fn soft_reset(&self, regs: &dyn RegisterFile, clock: &dyn Clock);

    /// Words `emit_fence` writes on `ring`
    fn fence_dw(&self, ring: usize) -> u32;

    /// Emit commands that store `seq` at `location` once everything before
    /// them has executed
    fn emit_fence(&self, ring: &mut RingBuffer, location: &FenceLocation, seq: u32) -> Result<()>;

    /// Words `emit_semaphore` writes on `ring`
    fn semaphore_dw(&self, ring: usize) -> u32;

    /// Emit a semaphore signal, or a wait when `wait` is set
    fn emit_semaphore(&self, ring: &mut RingBuffer, addr: u64, wait: bool) -> Result<()>;

    /// Words `emit_indirect` writes on `ring`
    fn ib_dw(&self, ring: usize) -> u32;

    /// Emit an indirect buffer launch
    fn emit_indirect(&self, ring: &mut RingBuffer, addr: u64, words: u32) -> Result<()>;

    /// Emit a single register write
    fn emit_reg_write(&self, ring: &mut RingBuffer, reg: u32, val: u32) -> Result<()>;

    /// Enable or disable ring completion interrupts
    fn irq_enable(&self, regs: &dyn RegisterFile, enable: bool);

    /// Acknowledge pending ring interrupts, returns the raw status
    fn irq_ack(&self, regs: &dyn RegisterFile) -> u32;
}

/// Pick the implementation for `family`
pub fn for_family(family: Family) -> Box<dyn Asic> {
    match family {
        Family::R100 => Box::new(R100),
        Family::R600 => Box::new(R600),
    }
}

/// Ring size field of the ring control registers, log2 of quadwords
pub(crate) fn rb_bufsz(words: u32) -> u32 {
    (words / 2).trailing_zeros()
}
