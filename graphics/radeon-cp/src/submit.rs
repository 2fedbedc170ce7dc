// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Command submission
//!
//! Every request follows the same path: size the packet stream, throttle on
//! the ring high-water mark, reserve, emit, stamp the relevant age counter,
//! fence and commit. A failure before the commit rewinds the ring, so a
//! rejected request never reaches the hardware, and the client visible
//! counters only move once their stamp is committed.

use crate::asic::{Asic, DMA_RING, GFX_RING};
use crate::config::Family;
use crate::device::{Device, HwGuard};
use crate::fence::Fence;
use crate::freelist::BufferState;
use crate::packet::{dma, lower_32, op, packet3, upper_8, PACKET2, PM4_MAX_REG};
use crate::regs::{r100, r600, ClearFlags, CLOCK_CNTL_DATA, CLOCK_CNTL_INDEX};
use crate::ring::RingBuffer;
use crate::sarea::Counter;
use crate::{Error, Result};

/// Clip rectangles accepted per request
pub const MAX_CLIPRECTS: usize = 12;

/// Largest copy a single DMA packet moves, in words
const DMA_COPY_MAX: u32 = 0xffff;

/// Words of an age stamp
const AGE_DW: u32 = 2;

const GMC_SRC_PITCH_OFFSET_CNTL: u32 = 1 << 0;
const GMC_DST_PITCH_OFFSET_CNTL: u32 = 1 << 1;
const GMC_BRUSH_SOLID_COLOR: u32 = 13 << 4;
const GMC_BRUSH_NONE: u32 = 15 << 4;
const GMC_SRC_DATATYPE_COLOR: u32 = 3 << 12;
const ROP3_S: u32 = 0x00cc_0000;
const ROP3_P: u32 = 0x00f0_0000;
const DP_SRC_SOURCE_MEMORY: u32 = 2 << 24;
const GMC_CLR_CMP_CNTL_DIS: u32 = 1 << 28;

const GMC_FILL: u32 = GMC_DST_PITCH_OFFSET_CNTL
    | GMC_BRUSH_SOLID_COLOR
    | GMC_SRC_DATATYPE_COLOR
    | ROP3_P
    | GMC_CLR_CMP_CNTL_DIS;
const GMC_COPY: u32 = GMC_SRC_PITCH_OFFSET_CNTL
    | GMC_DST_PITCH_OFFSET_CNTL
    | GMC_BRUSH_NONE
    | GMC_SRC_DATATYPE_COLOR
    | ROP3_S
    | DP_SRC_SOURCE_MEMORY
    | GMC_CLR_CMP_CNTL_DIS;

/// Screen rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub w: u16,
    pub h: u16,
}

impl Rect {
    fn xy(&self) -> u32 {
        (u32::from(self.x) << 16) | u32::from(self.y)
    }

    fn wh(&self) -> u32 {
        (u32::from(self.w) << 16) | u32::from(self.h)
    }
}

/// Fill the selected buffers inside `rects`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Clear {
    pub flags: ClearFlags,
    pub color: u32,
    pub color_mask: u32,
    pub depth: u32,
    pub front_pitch_offset: u32,
    pub back_pitch_offset: u32,
    pub depth_pitch_offset: u32,
    pub rects: Vec<Rect>,
}

/// Render vertices from a DMA buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Draw {
    pub buf_index: usize,
    /// Bytes of vertex data in the buffer
    pub bytes: usize,
    pub prim: u32,
    pub vertex_format: u32,
    pub vertex_count: u32,
    /// Hand the buffer back once the hardware is done with it
    pub discard: bool,
}

/// Upload image data from a DMA buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blit {
    pub buf_index: usize,
    pub bytes: usize,
    pub dst_pitch_offset: u32,
    /// Datatype bits of the destination
    pub format: u32,
    pub rect: Rect,
    pub discard: bool,
}

/// Execute bytes `start..end` of a DMA buffer as an indirect buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Indirect {
    pub buf_index: usize,
    pub start: usize,
    pub end: usize,
    pub discard: bool,
}

/// Copy the back buffer to the front buffer inside `rects`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Swap {
    pub front_pitch_offset: u32,
    pub back_pitch_offset: u32,
    pub rects: Vec<Rect>,
}

/// Buffer handed to a client by `get_buffers`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGrant {
    pub index: usize,
    /// Byte offset into the buffer region
    pub offset: usize,
    pub size: usize,
    pub bus_addr: u64,
}

fn check_rects(rects: &[Rect]) -> Result<()> {
    if rects.len() > MAX_CLIPRECTS {
        return Err(Error::InvalidArgument("too many clip rectangles"));
    }
    Ok(())
}

/// Registers clients may not write through state packets
fn state_reg_allowed(asic: &dyn Asic, reg: u32) -> bool {
    if reg % 4 != 0 || reg > PM4_MAX_REG {
        return false;
    }
    let ring_reg = (0..asic.num_rings()).any(|ring| {
        let layout = asic.ring_desc(ring).layout;
        [layout.base, layout.cntl, layout.rptr, layout.wptr].contains(&reg)
            || layout.rptr_addr == Some(reg)
    });
    let scratch0 = asic.scratch_reg(0);
    let scratch_reg = (scratch0..scratch0 + 4 * asic.num_scratch()).contains(&reg);
    let protected: &[u32] = match asic.family() {
        Family::R100 => &[
            r100::GEN_INT_CNTL,
            r100::GEN_INT_STATUS,
            r100::RBBM_SOFT_RESET,
            r100::CP_IB_BASE,
            r100::CP_IB_BUFSZ,
            r100::CP_CSQ_CNTL,
            r100::SCRATCH_UMSK,
            r100::SCRATCH_ADDR,
        ],
        Family::R600 => &[
            r600::GRBM_SOFT_RESET,
            r600::CP_ME_CNTL,
            r600::CP_INT_CNTL,
            r600::CP_INT_STATUS,
            r600::SCRATCH_UMSK,
            r600::SCRATCH_ADDR,
        ],
    };
    !ring_reg
        && !scratch_reg
        && !protected.contains(&reg)
        && reg != CLOCK_CNTL_INDEX
        && reg != CLOCK_CNTL_DATA
}

fn emit_age(dev: &Device, ring: &mut RingBuffer, counter: Counter, value: u32) -> Result<()> {
    dev.asic().emit_reg_write(ring, dev.asic().scratch_reg(counter.scratch()), value)
}

/// Claim `words` on `ring`, throttling on the high-water mark
///
/// A ring that stays full is given one fence's worth of time to drain. If
/// its read pointer has not moved for the lockup window the ring is
/// reported locked up instead.
fn make_room(dev: &Device, ring: &mut RingBuffer, words: u32, usec: u32) -> Result<()> {
    match ring
        .wait_high_water(usec)
        .and_then(|()| ring.reserve(words, usec))
    {
        Err(Error::Busy) => {}
        other => return other,
    }
    dev.stats().record_ring_wait();

    let lockup_us = dev.config().lockup_timeout.as_micros() as u64;
    if ring.test_lockup(lockup_us) {
        return Err(dev.fences().report_lockup(ring.id()));
    }
    dev.fences().wait_next(ring.id())?;
    ring.reserve(words, usec).map_err(|err| {
        if err == Error::Busy {
            dev.stats().record_ring_timeout();
        }
        err
    })
}

fn require_legacy_render(dev: &Device) -> Result<()> {
    if dev.asic().legacy_render() {
        Ok(())
    } else {
        Err(Error::NotSupported)
    }
}

impl<'a> HwGuard<'a> {
    /// Reserve `words` plus a fence on `ring_id`, let `emit` fill them,
    /// then fence and commit
    ///
    /// With a `stamp` the age is written after the emitted commands and
    /// published to the SAREA once the commit went through. Work queued on
    /// other rings that this ring has not synced with yet is waited for
    /// first.
    fn submit(
        &mut self,
        ring_id: usize,
        words: u32,
        stamp: Option<(Counter, u32)>,
        emit: impl FnOnce(&Device, &mut RingBuffer) -> Result<()>,
    ) -> Result<Fence> {
        let dev = self.dev;
        self.check_ring(ring_id)?;

        let others: Vec<Fence> = self
            .cp_mut()?
            .last_fence
            .iter()
            .enumerate()
            .filter(|(ring, _)| *ring != ring_id)
            .filter_map(|(_, fence)| fence.clone())
            .collect();
        for fence in &others {
            self.sync_rings(fence, ring_id)?;
        }

        let cp = self.cp_mut()?;
        let usec = cp.usec_timeout;
        let ring = cp.ring_mut(ring_id)?;
        let age_dw = if stamp.is_some() { AGE_DW } else { 0 };
        let total = words + age_dw + dev.asic().fence_dw(ring_id);

        if let Err(err) = make_room(dev, ring, total, usec) {
            if matches!(err, Error::Lockup { .. } | Error::RingNotReady { .. }) {
                ring.set_ready(false);
            }
            return Err(err);
        }

        let emitted = emit(dev, ring)
            .and_then(|()| match stamp {
                Some((counter, age)) => emit_age(dev, ring, counter, age),
                None => Ok(()),
            })
            .and_then(|()| dev.fences().emit(ring, dev.asic()));
        let fence = match emitted {
            Ok(fence) => fence,
            Err(err) => {
                ring.undo();
                log::error!("radeon: ring {} submission dropped: {}", ring_id, err);
                return Err(err);
            }
        };
        ring.commit();
        dev.stats().record_submission(total);
        if let Some((counter, age)) = stamp {
            dev.sarea().publish(counter, age);
        }

        cp.last_fence[ring_id] = Some(fence.clone());
        Ok(fence)
    }

    /// Write client register state
    pub fn emit_state(&mut self, writes: &[(u32, u32)]) -> Result<Fence> {
        let asic = self.dev.asic();
        if let Some(&(reg, _)) = writes.iter().find(|&&(reg, _)| !state_reg_allowed(asic, reg)) {
            log::error!("radeon: state write to protected register {:#06x}", reg);
            return Err(Error::InvalidArgument("register not writable"));
        }
        let words = 2 * writes.len() as u32;
        self.submit(GFX_RING, words, None, |dev, ring| {
            for &(reg, val) in writes {
                dev.asic().emit_reg_write(ring, reg, val)?;
            }
            Ok(())
        })
    }

    /// Fill buffers with a solid color or depth value
    pub fn clear(&mut self, clear: &Clear) -> Result<Fence> {
        require_legacy_render(self.dev)?;
        check_rects(&clear.rects)?;
        let colors: Vec<u32> = [
            (ClearFlags::FRONT, clear.front_pitch_offset),
            (ClearFlags::BACK, clear.back_pitch_offset),
        ]
        .iter()
        .filter(|(flag, _)| clear.flags.contains(*flag))
        .map(|&(_, pitch_offset)| pitch_offset)
        .collect();
        let depth = clear
            .flags
            .intersects(ClearFlags::DEPTH | ClearFlags::STENCIL);

        let rects = clear.rects.len() as u32;
        let mut words = 2 + rects * colors.len() as u32 * 7;
        if depth {
            words += 2 + rects * 7;
        }

        let age = self.dev.sarea().next(Counter::Clear);
        self.submit(GFX_RING, words, Some((Counter::Clear, age)), |dev, ring| {
            let asic = dev.asic();
            asic.emit_reg_write(ring, r100::DP_WRITE_MASK, clear.color_mask)?;
            for rect in &clear.rects {
                for &pitch_offset in &colors {
                    asic.emit_reg_write(ring, r100::DST_PITCH_OFFSET, pitch_offset)?;
                    ring.emit(packet3(op::PAINT_MULTI, 4));
                    ring.emit(GMC_FILL);
                    ring.emit(clear.color);
                    ring.emit(rect.xy());
                    ring.emit(rect.wh());
                }
            }
            if depth {
                asic.emit_reg_write(ring, r100::RB3D_DEPTHCLEARVALUE, clear.depth)?;
                for rect in &clear.rects {
                    asic.emit_reg_write(ring, r100::DST_PITCH_OFFSET, clear.depth_pitch_offset)?;
                    ring.emit(packet3(op::PAINT_MULTI, 4));
                    ring.emit(GMC_FILL);
                    ring.emit(clear.depth);
                    ring.emit(rect.xy());
                    ring.emit(rect.wh());
                }
            }
            Ok(())
        })
    }

    /// Draw vertices stored in a checked-out buffer
    pub fn draw(&mut self, draw: &Draw) -> Result<Fence> {
        require_legacy_render(self.dev)?;
        let pid = self.pid;
        let buf = self
            .cp_mut()?
            .freelist
            .check_dispatch(draw.buf_index, pid, draw.bytes)?;
        let addr = buf.bus_addr();
        let dwords = (draw.bytes / 4) as u32;

        let age = draw.discard.then(|| self.dev.sarea().next(Counter::Dispatch));
        let stamp = age.map(|age| (Counter::Dispatch, age));
        let fence = self.submit(GFX_RING, 2 + 4, stamp, |dev, ring| {
            dev.asic().emit_reg_write(ring, r100::SE_VTX_FMT, draw.vertex_format)?;
            ring.emit(packet3(op::RNDR_GEN_INDX_PRIM, 3));
            ring.emit(lower_32(addr));
            ring.emit(dwords);
            ring.emit((draw.vertex_count << 16) | (draw.prim & 0xffff));
            Ok(())
        })?;

        if let Some(age) = age {
            self.cp_mut()?.freelist.discard(draw.buf_index, pid, age)?;
        }
        Ok(fence)
    }

    /// Copy image data from a checked-out buffer to the screen
    pub fn blit(&mut self, blit: &Blit) -> Result<Fence> {
        require_legacy_render(self.dev)?;
        let pid = self.pid;
        let buf = self
            .cp_mut()?
            .freelist
            .check_dispatch(blit.buf_index, pid, blit.bytes)?;
        let addr = buf.bus_addr();

        let age = blit.discard.then(|| self.dev.sarea().next(Counter::Dispatch));
        let stamp = age.map(|age| (Counter::Dispatch, age));
        let fence = self.submit(GFX_RING, 6, stamp, |_, ring| {
            ring.emit(packet3(op::BITBLT_MULTI, 5));
            ring.emit(GMC_COPY | blit.format);
            ring.emit(lower_32(addr));
            ring.emit(blit.dst_pitch_offset);
            ring.emit(blit.rect.xy());
            ring.emit(blit.rect.wh());
            Ok(())
        })?;

        if let Some(age) = age {
            self.cp_mut()?.freelist.discard(blit.buf_index, pid, age)?;
        }
        Ok(fence)
    }

    /// Run part of a checked-out buffer as an indirect buffer
    pub fn indirect(&mut self, ib: &Indirect) -> Result<Fence> {
        let pid = self.pid;
        if ib.start >= ib.end || ib.start % 4 != 0 || ib.end % 4 != 0 {
            return Err(Error::InvalidArgument("indirect buffer range"));
        }
        let family = self.dev.asic().family();
        let cp = self.cp_mut()?;
        let (offset, size) = {
            let buf = cp.freelist.check_dispatch(ib.buf_index, pid, ib.end)?;
            (buf.offset(), buf.size())
        };

        let mut dwords = ((ib.end - ib.start) / 4) as u32;
        if family == Family::R100 && dwords % 2 != 0 {
            // Fetches are in pairs of words.
            if ib.end + 4 > size {
                return Err(Error::InvalidArgument("no room to pad indirect buffer"));
            }
            cp.freelist.region().write((offset + ib.end) / 4, PACKET2);
            cp.freelist.check_dispatch(ib.buf_index, pid, ib.end + 4)?;
            dwords += 1;
        }
        let addr = cp.freelist.region().bus_addr() + (offset + ib.start) as u64;

        let words = self.dev.asic().ib_dw(GFX_RING);
        let age = ib.discard.then(|| self.dev.sarea().next(Counter::Dispatch));
        let stamp = age.map(|age| (Counter::Dispatch, age));
        let fence = self.submit(GFX_RING, words, stamp, |dev, ring| {
            dev.asic().emit_indirect(ring, addr, dwords)
        })?;

        if let Some(age) = age {
            self.cp_mut()?.freelist.discard(ib.buf_index, pid, age)?;
        }
        Ok(fence)
    }

    /// Present the back buffer and advance the frame counter
    pub fn swap(&mut self, swap: &Swap) -> Result<Fence> {
        require_legacy_render(self.dev)?;
        check_rects(&swap.rects)?;
        let words = swap.rects.len() as u32 * 7;
        let frame = self.dev.sarea().next(Counter::Frame);
        self.submit(GFX_RING, words, Some((Counter::Frame, frame)), |_, ring| {
            for rect in &swap.rects {
                ring.emit(packet3(op::BITBLT_MULTI, 6));
                ring.emit(GMC_COPY);
                ring.emit(swap.back_pitch_offset);
                ring.emit(swap.front_pitch_offset);
                ring.emit(rect.xy());
                ring.emit(rect.xy());
                ring.emit(rect.wh());
            }
            Ok(())
        })
    }

    /// Copy `words` words from `src` to `dst` on the DMA ring
    ///
    /// Ordered after everything already submitted to the graphics ring.
    pub fn copy(&mut self, src: u64, dst: u64, words: u32) -> Result<Fence> {
        if self.dev.asic().num_rings() <= DMA_RING {
            return Err(Error::NotSupported);
        }
        if words == 0 || src % 4 != 0 || dst % 4 != 0 {
            return Err(Error::InvalidArgument("copy range"));
        }
        let chunks = words.div_ceil(DMA_COPY_MAX);
        self.submit(DMA_RING, chunks * 5, None, |_, ring| {
            let mut done = 0u32;
            while done < words {
                let n = (words - done).min(DMA_COPY_MAX);
                let offset = u64::from(done) * 4;
                ring.emit(dma::header(dma::COPY, 0, 0, n));
                ring.emit(lower_32(dst + offset));
                ring.emit(lower_32(src + offset));
                ring.emit(upper_8(dst + offset));
                ring.emit(upper_8(src + offset));
                done += n;
            }
            Ok(())
        })
    }

    /// Check out up to `count` buffers
    ///
    /// Returns the buffers it could get, `NoBuffers` if there were none.
    pub fn get_buffers(&mut self, count: usize) -> Result<Vec<BufferGrant>> {
        let dev = self.dev;
        let pid = self.pid;
        let cp = self.cp_mut()?;
        if count == 0 || count > cp.freelist.len() {
            return Err(Error::InvalidArgument("buffer count"));
        }

        let usec = cp.usec_timeout;
        let mut grants = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(index) = cp.freelist.acquire(
                pid,
                || dev.last_dispatch(),
                &**dev.clock(),
                usec,
                dev.stats(),
            ) else {
                break;
            };
            if let Some(buf) = cp.freelist.get(index) {
                grants.push(BufferGrant {
                    index,
                    offset: buf.offset(),
                    size: buf.size(),
                    bus_addr: buf.bus_addr(),
                });
            }
        }

        if grants.is_empty() {
            return Err(Error::NoBuffers);
        }
        if grants.len() < count {
            log::debug!("radeon: pid {} got {} of {} buffers", pid, grants.len(), count);
        }
        Ok(grants)
    }

    /// Return an unused checked-out buffer
    pub fn discard(&mut self, index: usize) -> Result<Fence> {
        let pid = self.pid;
        let state = self
            .cp_mut()?
            .freelist
            .get(index)
            .map(|buf| buf.state())
            .ok_or(Error::InvalidArgument("buffer index out of range"))?;
        if state != (BufferState::CheckedOut { pid }) {
            return Err(Error::NotOwner { index });
        }

        let age = self.dev.sarea().next(Counter::Dispatch);
        let fence = self.submit(GFX_RING, 0, Some((Counter::Dispatch, age)), |_, _| Ok(()))?;
        self.cp_mut()?.freelist.discard(index, pid, age)?;
        Ok(fence)
    }

    /// Age every buffer the holder still has checked out, for a closing
    /// client
    pub fn release_process(&mut self) -> Result<Option<Fence>> {
        let pid = self.pid;
        let held = self.cp_mut()?.freelist.reclaim(pid);
        if held.is_empty() {
            return Ok(None);
        }

        let age = self.dev.sarea().next(Counter::Dispatch);
        let fence = self.submit(GFX_RING, 0, Some((Counter::Dispatch, age)), |_, _| Ok(()))?;
        let cp = self.cp_mut()?;
        for index in &held {
            cp.freelist.discard(*index, pid, age)?;
        }
        log::debug!("radeon: pid {} released {} buffer(s)", pid, held.len());
        Ok(Some(fence))
    }
}
