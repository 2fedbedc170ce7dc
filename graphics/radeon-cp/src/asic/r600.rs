// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! R600 command processor and async DMA engine

use super::{rb_bufsz, Asic, RingDesc, DMA_RING, GFX_RING};
use crate::clock::Clock;
use crate::config::Family;
use crate::fence::FenceLocation;
use crate::packet::{
    dma, lower_32, op, packet0, packet3, upper_8, EOP_DATA_SEL_32, EOP_EVENT_TS, EOP_INT_SEL_IRQ,
    PACKET2, SEM_SEL_SIGNAL, SEM_SEL_WAIT,
};
use crate::regs::{r600, GrbmStatus, RegisterFile};
use crate::ring::{RingBuffer, RingKind, RingLayout};
use crate::{Error, Result};

/// `CP_COHER_CNTL` bits requesting a full color/depth cache flush
const COHER_FLUSH_ALL: u32 = 0x7fff_ffff;

/// R600 family: PM4 ring plus async DMA ring
pub struct R600;

impl R600 {
    fn dma_idle(regs: &dyn RegisterFile) -> bool {
        regs.read(r600::DMA_STATUS_REG) & r600::DMA_IDLE != 0
    }
}

impl Asic for R600 {
    fn family(&self) -> Family {
        Family::R600
    }

    fn name(&self) -> &'static str {
        "r600"
    }

    fn num_rings(&self) -> usize {
        2
    }

    fn ring_desc(&self, ring: usize) -> RingDesc {
        if ring == DMA_RING {
            RingDesc {
                kind: RingKind::Dma,
                layout: RingLayout {
                    base: r600::DMA_RB_BASE,
                    cntl: r600::DMA_RB_CNTL,
                    rptr: r600::DMA_RB_RPTR,
                    wptr: r600::DMA_RB_WPTR,
                    rptr_addr: None,
                    ptr_shift: 2,
                },
                align_mask: 15,
                nop: dma::header(dma::NOP, 0, 0, 0),
            }
        } else {
            RingDesc {
                kind: RingKind::Gfx,
                layout: RingLayout {
                    base: r600::CP_RB_BASE,
                    cntl: r600::CP_RB_CNTL,
                    rptr: r600::CP_RB_RPTR,
                    wptr: r600::CP_RB_WPTR,
                    rptr_addr: None,
                    ptr_shift: 0,
                },
                align_mask: 15,
                nop: PACKET2,
            }
        }
    }

    fn legacy_render(&self) -> bool {
        false
    }

    fn fifo_depth(&self) -> u32 {
        r600::FIFO_DEPTH
    }

    fn fifo_slots(&self, regs: &dyn RegisterFile) -> u32 {
        GrbmStatus::from_bits_retain(regs.read(r600::GRBM_STATUS)).fifo_slots()
    }

    fn engine_busy(&self, regs: &dyn RegisterFile) -> bool {
        let status = GrbmStatus::from_bits_retain(regs.read(r600::GRBM_STATUS));
        status.intersects(GrbmStatus::GUI_ACTIVE | GrbmStatus::CP_BUSY) || !Self::dma_idle(regs)
    }

    fn flush_caches(&self, regs: &dyn RegisterFile) {
        regs.write(r600::CP_COHER_CNTL, COHER_FLUSH_ALL);
    }

    fn caches_busy(&self, regs: &dyn RegisterFile) -> bool {
        regs.read(r600::CP_COHER_STATUS) & r600::COHER_STATUS_BUSY != 0
    }

    fn scratch_reg(&self, index: u32) -> u32 {
        r600::SCRATCH_REG0 + index * 4
    }

    fn num_scratch(&self) -> u32 {
        r600::NUM_SCRATCH
    }

    fn scratch_writeback(&self, regs: &dyn RegisterFile, addr: Option<u64>) {
        match addr {
            Some(addr) => {
                regs.write(r600::SCRATCH_ADDR, (addr >> 8) as u32);
                regs.write(r600::SCRATCH_UMSK, (1 << r600::NUM_SCRATCH) - 1);
            }
            None => regs.write(r600::SCRATCH_UMSK, 0),
        }
    }

    fn ring_start(&self, regs: &dyn RegisterFile, ring: &RingBuffer, _rptr_wb: Option<u64>) {
        let layout = ring.layout();
        let cntl = match ring.kind() {
            RingKind::Gfx => rb_bufsz(ring.size()),
            RingKind::Dma => ring.size().trailing_zeros() << 1,
        };
        regs.write(layout.base, (ring.gpu_addr() >> 8) as u32);
        regs.write(layout.cntl, cntl);
        regs.write(layout.wptr, 0);
        log::debug!(
            "radeon: r600 ring {} at {:#x}, {} words, cntl {:#x}",
            ring.id(),
            ring.gpu_addr(),
            ring.size(),
            cntl
        );
    }

    fn cp_start(&self, regs: &dyn RegisterFile) {
        regs.write(r600::CP_ME_CNTL, 0);
        regs.modify(r600::DMA_RB_CNTL, 0, r600::DMA_RB_ENABLE);
    }

    fn cp_stop(&self, regs: &dyn RegisterFile) {
        regs.write(r600::CP_ME_CNTL, r600::CP_ME_HALT | r600::CP_PFP_HALT);
        regs.modify(r600::DMA_RB_CNTL, r600::DMA_RB_ENABLE, 0);
    }

    fn soft_reset(&self, regs: &dyn RegisterFile, clock: &dyn Clock) {
        regs.write(r600::CP_ME_CNTL, r600::CP_ME_HALT | r600::CP_PFP_HALT);
        regs.write(r600::GRBM_SOFT_RESET, r600::SOFT_RESET_CP);
        let _ = regs.read(r600::GRBM_SOFT_RESET);
        clock.udelay(15);
        regs.write(r600::GRBM_SOFT_RESET, 0);
        let _ = regs.read(r600::GRBM_SOFT_RESET);
    }

    fn fence_dw(&self, ring: usize) -> u32 {
        if ring == DMA_RING {
            5
        } else {
            6
        }
    }

    fn emit_fence(&self, ring: &mut RingBuffer, location: &FenceLocation, seq: u32) -> Result<()> {
        let addr = match location {
            FenceLocation::Memory { region, index } => region.addr_of(*index),
            FenceLocation::Scratch { .. } => return Err(Error::NotSupported),
        };
        match ring.kind() {
            RingKind::Gfx => {
                ring.emit(packet3(op::EVENT_WRITE_EOP, 5));
                ring.emit(EOP_EVENT_TS | (5 << 8));
                ring.emit(lower_32(addr) & !3);
                ring.emit(upper_8(addr) | EOP_DATA_SEL_32 | EOP_INT_SEL_IRQ);
                ring.emit(seq);
                ring.emit(0);
            }
            RingKind::Dma => {
                ring.emit(dma::header(dma::FENCE, 0, 0, 0));
                ring.emit(lower_32(addr) & !3);
                ring.emit(upper_8(addr));
                ring.emit(seq);
                ring.emit(dma::header(dma::TRAP, 0, 0, 0));
            }
        }
        Ok(())
    }

    fn semaphore_dw(&self, _ring: usize) -> u32 {
        3
    }

    fn emit_semaphore(&self, ring: &mut RingBuffer, addr: u64, wait: bool) -> Result<()> {
        match ring.kind() {
            RingKind::Gfx => {
                let sel = if wait { SEM_SEL_WAIT } else { SEM_SEL_SIGNAL };
                ring.emit(packet3(op::MEM_SEMAPHORE, 2));
                ring.emit(lower_32(addr) & !7);
                ring.emit(upper_8(addr) | sel);
            }
            RingKind::Dma => {
                let signal = if wait { 0 } else { 1 };
                ring.emit(dma::header(dma::SEMAPHORE, 0, signal, 0));
                ring.emit(lower_32(addr) & !7);
                ring.emit(upper_8(addr));
            }
        }
        Ok(())
    }

    fn ib_dw(&self, ring: usize) -> u32 {
        if ring == DMA_RING {
            3
        } else {
            4
        }
    }

    fn emit_indirect(&self, ring: &mut RingBuffer, addr: u64, words: u32) -> Result<()> {
        match ring.kind() {
            RingKind::Gfx => {
                ring.emit(packet3(op::INDIRECT_BUFFER, 3));
                ring.emit(lower_32(addr) & !3);
                ring.emit(upper_8(addr));
                ring.emit(words);
            }
            RingKind::Dma => {
                if addr & 0x1f != 0 || words > 0xffff {
                    return Err(Error::InvalidArgument("misaligned DMA indirect buffer"));
                }
                ring.emit(dma::header(dma::INDIRECT_BUFFER, 0, 0, 0));
                ring.emit(lower_32(addr));
                ring.emit((words << 16) | upper_8(addr));
            }
        }
        Ok(())
    }

    fn emit_reg_write(&self, ring: &mut RingBuffer, reg: u32, val: u32) -> Result<()> {
        if ring.id() != GFX_RING {
            return Err(Error::NotSupported);
        }
        ring.emit(packet0(reg, 1));
        ring.emit(val);
        Ok(())
    }

    fn irq_enable(&self, regs: &dyn RegisterFile, enable: bool) {
        regs.write(
            r600::CP_INT_CNTL,
            if enable { r600::RB_INT_ENABLE } else { 0 },
        );
    }

    fn irq_ack(&self, regs: &dyn RegisterFile) -> u32 {
        let status = regs.read(r600::CP_INT_STATUS);
        if status != 0 {
            regs.write(r600::CP_INT_STATUS, status);
        }
        status
    }
}
