// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! R100-R500 command processor

use super::{rb_bufsz, Asic, RingDesc, GFX_RING};
use crate::clock::Clock;
use crate::config::Family;
use crate::fence::FenceLocation;
use crate::packet::{lower_32, packet0, PACKET2};
use crate::regs::{pll, r100, RbbmStatus, RegisterFile, CLOCK_CNTL_INDEX};
use crate::ring::{RingBuffer, RingKind, RingLayout};
use crate::{Error, Result};

const SOFT_RESET_ALL: u32 = r100::SOFT_RESET_CP
    | r100::SOFT_RESET_HI
    | r100::SOFT_RESET_SE
    | r100::SOFT_RESET_RE
    | r100::SOFT_RESET_PP
    | r100::SOFT_RESET_E2
    | r100::SOFT_RESET_RB;

const MCLK_FORCEON: u32 = pll::FORCEON_MCLKA
    | pll::FORCEON_MCLKB
    | pll::FORCEON_YCLKA
    | pll::FORCEON_YCLKB
    | pll::FORCEON_MC
    | pll::FORCEON_AIC;

/// R100 family: a single PM4 ring
pub struct R100;

impl Asic for R100 {
    fn family(&self) -> Family {
        Family::R100
    }

    fn name(&self) -> &'static str {
        "r100"
    }

    fn num_rings(&self) -> usize {
        1
    }

    fn ring_desc(&self, _ring: usize) -> RingDesc {
        RingDesc {
            kind: RingKind::Gfx,
            layout: RingLayout {
                base: r100::CP_RB_BASE,
                cntl: r100::CP_RB_CNTL,
                rptr: r100::CP_RB_RPTR,
                wptr: r100::CP_RB_WPTR,
                rptr_addr: Some(r100::CP_RB_RPTR_ADDR),
                ptr_shift: 0,
            },
            align_mask: 15,
            nop: PACKET2,
        }
    }

    fn legacy_render(&self) -> bool {
        true
    }

    fn fifo_depth(&self) -> u32 {
        r100::FIFO_DEPTH
    }

    fn fifo_slots(&self, regs: &dyn RegisterFile) -> u32 {
        RbbmStatus::from_bits_retain(regs.read(r100::RBBM_STATUS)).fifo_slots()
    }

    fn engine_busy(&self, regs: &dyn RegisterFile) -> bool {
        RbbmStatus::from_bits_retain(regs.read(r100::RBBM_STATUS)).contains(RbbmStatus::ACTIVE)
    }

    fn flush_caches(&self, regs: &dyn RegisterFile) {
        regs.modify(r100::RB3D_DSTCACHE_CTLSTAT, 0, r100::RB3D_DC_FLUSH_ALL);
    }

    fn caches_busy(&self, regs: &dyn RegisterFile) -> bool {
        regs.read(r100::RB3D_DSTCACHE_CTLSTAT) & r100::RB3D_DC_BUSY != 0
    }

    fn scratch_reg(&self, index: u32) -> u32 {
        r100::SCRATCH_REG0 + index * 4
    }

    fn num_scratch(&self) -> u32 {
        r100::NUM_SCRATCH
    }

    fn scratch_writeback(&self, regs: &dyn RegisterFile, addr: Option<u64>) {
        match addr {
            Some(addr) => {
                regs.write(r100::SCRATCH_ADDR, lower_32(addr));
                regs.write(r100::SCRATCH_UMSK, (1 << r100::NUM_SCRATCH) - 1);
            }
            None => regs.write(r100::SCRATCH_UMSK, 0),
        }
    }

    fn ring_start(&self, regs: &dyn RegisterFile, ring: &RingBuffer, rptr_wb: Option<u64>) {
        let mut cntl = rb_bufsz(ring.size());
        match rptr_wb {
            Some(addr) => regs.write(r100::CP_RB_RPTR_ADDR, lower_32(addr)),
            None => cntl |= r100::RB_NO_UPDATE,
        }
        regs.write(r100::CP_RB_BASE, lower_32(ring.gpu_addr()));
        regs.write(r100::CP_RB_CNTL, cntl);
        regs.write(r100::CP_RB_WPTR, 0);
        log::debug!(
            "radeon: r100 ring at {:#x}, {} words, cntl {:#x}",
            ring.gpu_addr(),
            ring.size(),
            cntl
        );
    }

    fn cp_start(&self, regs: &dyn RegisterFile) {
        regs.write(r100::CP_CSQ_CNTL, r100::CSQ_PRIBM_INDBM);
    }

    fn cp_stop(&self, regs: &dyn RegisterFile) {
        regs.write(r100::CP_CSQ_CNTL, r100::CSQ_PRIDIS_INDDIS);
    }

    fn soft_reset(&self, regs: &dyn RegisterFile, _clock: &dyn Clock) {
        let clock_cntl_index = regs.read(CLOCK_CNTL_INDEX);
        let mclk_cntl = regs.read_pll(pll::MCLK_CNTL);
        regs.write_pll(pll::MCLK_CNTL, mclk_cntl | MCLK_FORCEON);

        let rbbm_soft_reset = regs.read(r100::RBBM_SOFT_RESET);
        regs.write(r100::RBBM_SOFT_RESET, rbbm_soft_reset | SOFT_RESET_ALL);
        let _ = regs.read(r100::RBBM_SOFT_RESET);
        regs.write(r100::RBBM_SOFT_RESET, rbbm_soft_reset & !SOFT_RESET_ALL);
        let _ = regs.read(r100::RBBM_SOFT_RESET);

        regs.write_pll(pll::MCLK_CNTL, mclk_cntl);
        regs.write(CLOCK_CNTL_INDEX, clock_cntl_index);
    }

    fn fence_dw(&self, _ring: usize) -> u32 {
        10
    }

    fn emit_fence(&self, ring: &mut RingBuffer, location: &FenceLocation, seq: u32) -> Result<()> {
        let reg = match location {
            FenceLocation::Scratch { reg, .. } => *reg,
            FenceLocation::Memory { .. } => return Err(Error::NotSupported),
        };
        // Flush the caches and wait for the engines before the value lands.
        ring.emit(packet0(r100::RB3D_DSTCACHE_CTLSTAT, 1));
        ring.emit(r100::RB3D_DC_FLUSH_ALL);
        ring.emit(packet0(r100::RB3D_ZCACHE_CTLSTAT, 1));
        ring.emit(r100::RB3D_ZC_FLUSH_ALL);
        ring.emit(packet0(r100::WAIT_UNTIL, 1));
        ring.emit(r100::WAIT_2D_IDLECLEAN | r100::WAIT_3D_IDLECLEAN | r100::WAIT_HOST_IDLECLEAN);
        ring.emit(packet0(reg, 1));
        ring.emit(seq);
        ring.emit(packet0(r100::GEN_INT_STATUS, 1));
        ring.emit(r100::SW_INT_FIRE);
        Ok(())
    }

    fn semaphore_dw(&self, _ring: usize) -> u32 {
        0
    }

    fn emit_semaphore(&self, _ring: &mut RingBuffer, _addr: u64, _wait: bool) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn ib_dw(&self, _ring: usize) -> u32 {
        3
    }

    fn emit_indirect(&self, ring: &mut RingBuffer, addr: u64, words: u32) -> Result<()> {
        if ring.id() != GFX_RING {
            return Err(Error::InvalidArgument("no such ring"));
        }
        ring.emit(packet0(r100::CP_IB_BASE, 2));
        ring.emit(lower_32(addr));
        ring.emit(words);
        Ok(())
    }

    fn emit_reg_write(&self, ring: &mut RingBuffer, reg: u32, val: u32) -> Result<()> {
        ring.emit(packet0(reg, 1));
        ring.emit(val);
        Ok(())
    }

    fn irq_enable(&self, regs: &dyn RegisterFile, enable: bool) {
        regs.write(
            r100::GEN_INT_CNTL,
            if enable { r100::SW_INT_ENABLE } else { 0 },
        );
    }

    fn irq_ack(&self, regs: &dyn RegisterFile) -> u32 {
        let status = regs.read(r100::GEN_INT_STATUS) & r100::SW_INT_TEST;
        if status != 0 {
            regs.write(r100::GEN_INT_STATUS, status);
        }
        status
    }
}
