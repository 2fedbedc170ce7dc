// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Software stand-ins for the hardware
//!
//! [`ManualClock`] is a virtual microsecond clock, [`RegisterMap`] a plain
//! register array, and [`SimGpu`] a command processor model that fetches
//! from the attached rings and executes the PM4 and DMA packets this crate
//! emits: register writes, scratch writeback, end-of-pipe fences,
//! semaphores, indirect buffers and interrupts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use spin::Mutex;

use crate::asic::{self, DMA_RING};
use crate::clock::Clock;
use crate::config::Family;
use crate::dma::{DmaAllocator, DmaRegion, GartAperture};
use crate::irq::{IrqLine, IrqSource};
use crate::packet::{dma, op, Pm4, SEM_SEL_WAIT};
use crate::regs::{
    r100, r600, GrbmStatus, RbbmStatus, RegisterFile, CLOCK_CNTL_DATA, CLOCK_CNTL_INDEX,
    PLL_INDEX_MASK, PLL_WR_EN,
};
use crate::ring::{RingKind, RingLayout};
use crate::Result;

/// Virtual clock advanced only by `udelay` and `advance`
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, us: u64) {
        self.now.fetch_add(us, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    fn udelay(&self, us: u32) {
        self.advance(u64::from(us));
    }
}

/// Registers as plain storage, no side effects
#[derive(Default)]
pub struct RegisterMap {
    regs: Mutex<HashMap<u32, u32>>,
}

impl RegisterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, reg: u32) -> u32 {
        self.regs.lock().get(&reg).copied().unwrap_or(0)
    }

    pub fn set(&self, reg: u32, val: u32) {
        self.regs.lock().insert(reg, val);
    }
}

impl RegisterFile for RegisterMap {
    fn read(&self, reg: u32) -> u32 {
        self.get(reg)
    }

    fn write(&self, reg: u32, val: u32) {
        self.set(reg, val);
    }
}

/// Outcome of executing one packet
enum Exec {
    Done,
    /// Semaphore not yet signaled, retry the same packet later
    Stall,
    /// Malformed packet, the ring stops
    Fault,
}

struct SimRing {
    kind: RingKind,
    layout: RingLayout,
    base: u64,
    size: u32,
    rptr: u32,
    wptr: u32,
    hung: bool,
    no_update: bool,
    rptr_wb: Option<u64>,
}

impl SimRing {
    fn mask(&self) -> u32 {
        self.size.wrapping_sub(1)
    }

    fn attached(&self) -> bool {
        self.size != 0
    }

    fn pending(&self) -> u32 {
        self.wptr.wrapping_sub(self.rptr) & self.mask()
    }
}

struct SimState {
    regs: HashMap<u32, u32>,
    pll: HashMap<u32, u32>,
    rings: Vec<SimRing>,
    auto_run: bool,
    cp_halted: bool,
    dma_enabled: bool,
    busy: bool,
    fifo_slots: Option<u32>,
    cache_stuck: bool,
    /// Executed type-3 packets by opcode
    packets: HashMap<u32, usize>,
    soft_resets: usize,
}

/// Simulated command processor with a GART aperture
pub struct SimGpu {
    family: Family,
    state: Mutex<SimState>,
    gart: GartAperture,
    regions: Mutex<Vec<Weak<DmaRegion>>>,
    irq: Mutex<Option<Arc<IrqLine>>>,
}

impl SimGpu {
    /// GPU of `family` with a GART aperture of `gart_size` bytes
    pub fn new(family: Family, gart_base: u64, gart_size: u64) -> Self {
        let asic = asic::for_family(family);
        let rings = (0..asic.num_rings())
            .map(|ring| {
                let desc = asic.ring_desc(ring);
                SimRing {
                    kind: desc.kind,
                    layout: desc.layout,
                    base: 0,
                    size: 0,
                    rptr: 0,
                    wptr: 0,
                    hung: false,
                    no_update: false,
                    rptr_wb: None,
                }
            })
            .collect();

        Self {
            family,
            state: Mutex::new(SimState {
                regs: HashMap::new(),
                pll: HashMap::new(),
                rings,
                auto_run: true,
                cp_halted: true,
                dma_enabled: false,
                busy: false,
                fifo_slots: None,
                cache_stuck: false,
                packets: HashMap::new(),
                soft_resets: 0,
            }),
            gart: GartAperture::new(gart_base, gart_size),
            regions: Mutex::new(Vec::new()),
            irq: Mutex::new(None),
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Bytes of the GART aperture not handed out
    pub fn gart_available(&self) -> u64 {
        self.gart.available()
    }

    /// Deliver interrupts to `line`
    pub fn attach_irq(&self, line: Arc<IrqLine>) {
        *self.irq.lock() = Some(line);
    }

    /// Execute on every write pointer update, or only on `run`
    pub fn set_auto_run(&self, auto: bool) {
        self.state.lock().auto_run = auto;
    }

    /// Execute everything fetchable on all rings
    pub fn run(&self) {
        let mut st = self.state.lock();
        self.run_all(&mut st);
    }

    /// Stop ring `ring` from making progress until the next soft reset
    pub fn hang(&self, ring: usize) {
        if let Some(ring) = self.state.lock().rings.get_mut(ring) {
            ring.hung = true;
        }
    }

    /// Report the engines as active regardless of ring state
    pub fn set_busy(&self, busy: bool) {
        self.state.lock().busy = busy;
    }

    /// Override the free FIFO entry count
    pub fn set_fifo_slots(&self, slots: Option<u32>) {
        self.state.lock().fifo_slots = slots;
    }

    /// Keep the cache flush busy bit set
    pub fn set_cache_stuck(&self, stuck: bool) {
        self.state.lock().cache_stuck = stuck;
    }

    /// Type-3 packets executed with `opcode`
    pub fn packets(&self, opcode: u32) -> usize {
        self.state.lock().packets.get(&opcode).copied().unwrap_or(0)
    }

    /// Hardware read pointer of `ring` in words
    pub fn rptr(&self, ring: usize) -> u32 {
        self.state.lock().rings.get(ring).map_or(0, |r| r.rptr)
    }

    /// Words fetched but not executed on `ring`
    pub fn pending(&self, ring: usize) -> u32 {
        self.state
            .lock()
            .rings
            .get(ring)
            .map_or(0, |r| if r.attached() { r.pending() } else { 0 })
    }

    pub fn soft_resets(&self) -> usize {
        self.state.lock().soft_resets
    }

    pub fn is_halted(&self) -> bool {
        self.state.lock().cp_halted
    }

    /// Read GPU memory
    pub fn peek(&self, addr: u64) -> Option<u32> {
        self.lookup(addr).map(|(region, index)| region.read(index))
    }

    /// Write GPU memory
    pub fn poke(&self, addr: u64, val: u32) -> bool {
        match self.lookup(addr) {
            Some((region, index)) => {
                region.write(index, val);
                true
            }
            None => false,
        }
    }

    fn lookup(&self, addr: u64) -> Option<(Arc<DmaRegion>, usize)> {
        let regions = self.regions.lock();
        regions.iter().filter_map(Weak::upgrade).find_map(|region| {
            let index = region.index_of(addr)?;
            Some((region, index))
        })
    }

    fn raise(&self, source: IrqSource) {
        if let Some(line) = self.irq.lock().as_ref() {
            line.raise(source);
        }
    }

    fn scratch_range(&self) -> (u32, u32) {
        match self.family {
            Family::R100 => (r100::SCRATCH_REG0, r100::NUM_SCRATCH),
            Family::R600 => (r600::SCRATCH_REG0, r600::NUM_SCRATCH),
        }
    }

    fn scratch_mirror(&self, st: &SimState, index: u32) -> Option<u64> {
        let (umsk, addr, shift) = match self.family {
            Family::R100 => (r100::SCRATCH_UMSK, r100::SCRATCH_ADDR, 0),
            Family::R600 => (r600::SCRATCH_UMSK, r600::SCRATCH_ADDR, 8),
        };
        let mask = st.regs.get(&umsk).copied().unwrap_or(0);
        if mask & (1 << index) == 0 {
            return None;
        }
        let base = u64::from(st.regs.get(&addr).copied().unwrap_or(0)) << shift;
        Some(base + u64::from(index) * 4)
    }

    fn soft_reset_cp(&self, st: &mut SimState) {
        for ring in st.rings.iter_mut() {
            ring.hung = false;
        }
        st.soft_resets += 1;
    }

    fn ring_start_allowed(&self, st: &SimState, ring: &SimRing) -> bool {
        match ring.kind {
            RingKind::Gfx => !st.cp_halted,
            RingKind::Dma => st.dma_enabled,
        }
    }

    fn write_reg(&self, st: &mut SimState, reg: u32, val: u32, from_cp: bool) {
        if let Some(i) = st.rings.iter().position(|r| r.layout.base == reg) {
            let shift = if self.family == Family::R600 { 8 } else { 0 };
            let ring = &mut st.rings[i];
            ring.base = u64::from(val) << shift;
            ring.rptr = 0;
            ring.wptr = 0;
            st.regs.insert(reg, val);
            return;
        }
        if let Some(i) = st.rings.iter().position(|r| r.layout.cntl == reg) {
            let ring = &mut st.rings[i];
            match ring.kind {
                RingKind::Gfx => {
                    ring.size = 2 << (val & 0x3f);
                    ring.no_update = val & r100::RB_NO_UPDATE != 0;
                }
                RingKind::Dma => {
                    ring.size = 1 << ((val >> 1) & 0x1f);
                    st.dma_enabled = val & r600::DMA_RB_ENABLE != 0;
                }
            }
            st.regs.insert(reg, val);
            if st.auto_run {
                self.run_all(st);
            }
            return;
        }
        if let Some(i) = st.rings.iter().position(|r| r.layout.wptr == reg) {
            let ring = &mut st.rings[i];
            ring.wptr = (val >> ring.layout.ptr_shift) & ring.mask();
            st.regs.insert(reg, val);
            if st.auto_run && !from_cp {
                self.run_all(st);
            }
            return;
        }
        if let Some(i) = st.rings.iter().position(|r| r.layout.rptr_addr == Some(reg)) {
            st.rings[i].rptr_wb = Some(u64::from(val));
            st.regs.insert(reg, val);
            return;
        }

        let (scratch0, nscratch) = self.scratch_range();
        if (scratch0..scratch0 + nscratch * 4).contains(&reg) {
            st.regs.insert(reg, val);
            if let Some(addr) = self.scratch_mirror(st, (reg - scratch0) / 4) {
                self.poke(addr, val);
            }
            return;
        }

        match (self.family, reg) {
            (_, CLOCK_CNTL_DATA) => {
                let index = st.regs.get(&CLOCK_CNTL_INDEX).copied().unwrap_or(0);
                if index & PLL_WR_EN != 0 {
                    st.pll.insert(index & PLL_INDEX_MASK, val);
                }
            }
            (Family::R100, r100::CP_CSQ_CNTL) => {
                st.cp_halted = val == r100::CSQ_PRIDIS_INDDIS;
                if !st.cp_halted && st.auto_run {
                    self.run_all(st);
                }
            }
            (Family::R600, r600::CP_ME_CNTL) => {
                st.cp_halted = val & r600::CP_ME_HALT != 0;
                if !st.cp_halted && st.auto_run {
                    self.run_all(st);
                }
            }
            (Family::R100, r100::RBBM_SOFT_RESET) => {
                if val & r100::SOFT_RESET_CP != 0 {
                    self.soft_reset_cp(st);
                }
            }
            (Family::R600, r600::GRBM_SOFT_RESET) => {
                if val & r600::SOFT_RESET_CP != 0 {
                    self.soft_reset_cp(st);
                }
            }
            (Family::R100, r100::GEN_INT_STATUS) => {
                let status = st.regs.get(&reg).copied().unwrap_or(0);
                if from_cp {
                    if val & r100::SW_INT_FIRE != 0 {
                        st.regs.insert(reg, status | r100::SW_INT_TEST);
                        let cntl = st.regs.get(&r100::GEN_INT_CNTL).copied().unwrap_or(0);
                        if cntl & r100::SW_INT_ENABLE != 0 {
                            self.raise(IrqSource::Ring(0));
                        }
                    }
                } else {
                    st.regs.insert(reg, status & !val);
                }
                return;
            }
            (Family::R600, r600::CP_INT_STATUS) => {
                let status = st.regs.get(&reg).copied().unwrap_or(0);
                st.regs.insert(reg, status & !val);
                return;
            }
            (Family::R100, r100::CP_IB_BUFSZ) if from_cp => {
                st.regs.insert(reg, val);
                let base = st.regs.get(&r100::CP_IB_BASE).copied().unwrap_or(0);
                self.exec_indirect(st, RingKind::Gfx, u64::from(base), val);
                return;
            }
            _ => {}
        }
        st.regs.insert(reg, val);
    }

    fn read_reg(&self, st: &SimState, reg: u32) -> u32 {
        if let Some(ring) = st.rings.iter().find(|r| r.layout.rptr == reg) {
            return ring.rptr << ring.layout.ptr_shift;
        }
        let stored = st.regs.get(&reg).copied().unwrap_or(0);
        let gfx_pending = st.rings.iter().any(|r| {
            r.kind == RingKind::Gfx && r.attached() && r.pending() != 0
        });
        let dma_pending = st.rings.iter().any(|r| {
            r.kind == RingKind::Dma && r.attached() && r.pending() != 0
        });

        match (self.family, reg) {
            (_, CLOCK_CNTL_DATA) => {
                let index = st.regs.get(&CLOCK_CNTL_INDEX).copied().unwrap_or(0);
                st.pll.get(&(index & PLL_INDEX_MASK)).copied().unwrap_or(0)
            }
            (Family::R100, r100::RBBM_STATUS) => {
                let mut status = RbbmStatus::from_bits_retain(
                    st.fifo_slots.unwrap_or(r100::FIFO_DEPTH) & RbbmStatus::FIFOCNT.bits(),
                );
                if st.busy || gfx_pending {
                    status |= RbbmStatus::ACTIVE | RbbmStatus::CP_CMDSTRM_BUSY;
                }
                status.bits()
            }
            (Family::R600, r600::GRBM_STATUS) => {
                let mut status = GrbmStatus::from_bits_retain(
                    st.fifo_slots.unwrap_or(r600::FIFO_DEPTH) & GrbmStatus::CMDFIFO_AVAIL.bits(),
                );
                if st.busy || gfx_pending {
                    status |= GrbmStatus::GUI_ACTIVE | GrbmStatus::CP_BUSY;
                }
                status.bits()
            }
            (Family::R600, r600::DMA_STATUS_REG) => {
                if st.busy || dma_pending {
                    0
                } else {
                    r600::DMA_IDLE
                }
            }
            (Family::R100, r100::RB3D_DSTCACHE_CTLSTAT) => {
                if st.cache_stuck {
                    stored | r100::RB3D_DC_BUSY
                } else {
                    stored & !r100::RB3D_DC_BUSY
                }
            }
            (Family::R600, r600::CP_COHER_STATUS) => {
                if st.cache_stuck {
                    r600::COHER_STATUS_BUSY
                } else {
                    0
                }
            }
            _ => stored,
        }
    }

    fn run_all(&self, st: &mut SimState) {
        loop {
            let mut progress = false;
            for ring in 0..st.rings.len() {
                progress |= self.run_ring(st, ring);
            }
            if !progress {
                break;
            }
        }
    }

    /// Execute ring `i` until it is empty or blocked, returns whether the
    /// read pointer moved
    fn run_ring(&self, st: &mut SimState, i: usize) -> bool {
        let mut progress = false;
        loop {
            let ring = &st.rings[i];
            if !ring.attached() || ring.hung || !self.ring_start_allowed(st, ring) {
                break;
            }
            let pending = ring.pending();
            if pending == 0 {
                break;
            }

            let (base, rptr, mask, kind) = (ring.base, ring.rptr, ring.mask(), ring.kind);
            let word_addr = |k: u32| base + u64::from((rptr + k) & mask) * 4;
            let header = self.peek(word_addr(0)).unwrap_or(0);
            let len = match kind {
                RingKind::Gfx => match Pm4::decode(header) {
                    Pm4::Type1 => None,
                    pkt => Some(pkt.len()),
                },
                RingKind::Dma => dma::len(header),
            };
            let Some(len) = len else {
                log::error!("radeon sim: ring {} bad packet header {:#010x}", i, header);
                st.rings[i].hung = true;
                break;
            };
            if len as u32 > pending {
                break;
            }

            let words: Vec<u32> = (0..len as u32)
                .map(|k| self.peek(word_addr(k)).unwrap_or(0))
                .collect();
            let result = match kind {
                RingKind::Gfx => self.exec_pm4(st, &words),
                RingKind::Dma => self.exec_dma(st, &words),
            };
            match result {
                Exec::Done => {
                    let ring = &mut st.rings[i];
                    ring.rptr = (ring.rptr + len as u32) & ring.mask();
                    progress = true;
                    if let (Some(addr), false) = (ring.rptr_wb, ring.no_update) {
                        let rptr = ring.rptr;
                        self.poke(addr, rptr);
                    }
                }
                Exec::Stall => break,
                Exec::Fault => {
                    log::error!("radeon sim: ring {} fault at {}", i, rptr);
                    st.rings[i].hung = true;
                    break;
                }
            }
        }
        progress
    }

    /// Run an indirect buffer to completion
    fn exec_indirect(&self, st: &mut SimState, kind: RingKind, addr: u64, words: u32) {
        let mut pos = 0u32;
        while pos < words {
            let word_addr = |k: u32| addr + u64::from(pos + k) * 4;
            let header = self.peek(word_addr(0)).unwrap_or(0);
            let len = match kind {
                RingKind::Gfx => match Pm4::decode(header) {
                    Pm4::Type1 => None,
                    pkt => Some(pkt.len() as u32),
                },
                RingKind::Dma => dma::len(header).map(|len| len as u32),
            };
            let Some(len) = len.filter(|&len| pos + len <= words) else {
                log::error!("radeon sim: bad indirect buffer packet at {:#x}", word_addr(0));
                return;
            };
            let packet: Vec<u32> = (0..len).map(|k| self.peek(word_addr(k)).unwrap_or(0)).collect();
            let result = match kind {
                RingKind::Gfx => self.exec_pm4(st, &packet),
                RingKind::Dma => self.exec_dma(st, &packet),
            };
            if !matches!(result, Exec::Done) {
                log::error!("radeon sim: indirect buffer packet did not complete");
                return;
            }
            pos += len;
        }
    }

    fn semaphore(&self, addr: u64, wait: bool) -> Exec {
        let Some(val) = self.peek(addr) else {
            return Exec::Fault;
        };
        if !wait {
            self.poke(addr, val.wrapping_add(1));
            Exec::Done
        } else if val == 0 {
            Exec::Stall
        } else {
            self.poke(addr, val - 1);
            Exec::Done
        }
    }

    fn exec_pm4(&self, st: &mut SimState, words: &[u32]) -> Exec {
        match Pm4::decode(words[0]) {
            Pm4::Type0 { reg, one_reg, .. } => {
                for (k, &val) in words[1..].iter().enumerate() {
                    let target = if one_reg { reg } else { reg + 4 * k as u32 };
                    self.write_reg(st, target, val, true);
                }
                Exec::Done
            }
            Pm4::Type1 => Exec::Fault,
            Pm4::Type2 => Exec::Done,
            Pm4::Type3 { opcode, .. } => {
                let addr = |lo: usize, hi: usize| {
                    u64::from(words[lo]) | (u64::from(words[hi] & 0xff) << 32)
                };
                let result = match opcode {
                    op::INDIRECT_BUFFER if words.len() >= 4 => {
                        self.exec_indirect(st, RingKind::Gfx, addr(1, 2), words[3]);
                        Exec::Done
                    }
                    op::EVENT_WRITE_EOP if words.len() >= 6 => {
                        if !self.poke(addr(2, 3), words[4]) {
                            return Exec::Fault;
                        }
                        if (words[3] >> 24) & 0x3 != 0 {
                            let status = st.regs.get(&r600::CP_INT_STATUS).copied().unwrap_or(0);
                            st.regs.insert(r600::CP_INT_STATUS, status | r600::RB_INT_ENABLE);
                            let cntl = st.regs.get(&r600::CP_INT_CNTL).copied().unwrap_or(0);
                            if cntl & r600::RB_INT_ENABLE != 0 {
                                self.raise(IrqSource::Ring(0));
                            }
                        }
                        Exec::Done
                    }
                    op::MEM_SEMAPHORE if words.len() >= 3 => {
                        let wait = words[2] & (0x7 << 29) == SEM_SEL_WAIT;
                        self.semaphore(addr(1, 2) & !7, wait)
                    }
                    op::INDIRECT_BUFFER | op::EVENT_WRITE_EOP | op::MEM_SEMAPHORE => Exec::Fault,
                    _ => Exec::Done,
                };
                if matches!(result, Exec::Done) {
                    *st.packets.entry(opcode).or_insert(0) += 1;
                }
                result
            }
        }
    }

    fn exec_dma(&self, st: &mut SimState, words: &[u32]) -> Exec {
        let header = words[0];
        let count = header & 0xffff;
        let addr = |lo: usize, hi: usize| u64::from(words[lo]) | (u64::from(words[hi] & 0xff) << 32);
        match header >> 28 {
            dma::WRITE => {
                let dst = addr(1, 2) & !3;
                for (k, &val) in words[3..].iter().enumerate() {
                    if !self.poke(dst + 4 * k as u64, val) {
                        return Exec::Fault;
                    }
                }
                Exec::Done
            }
            dma::COPY => {
                let dst = addr(1, 3) & !3;
                let src = addr(2, 4) & !3;
                for k in 0..u64::from(count) {
                    let Some(val) = self.peek(src + 4 * k) else {
                        return Exec::Fault;
                    };
                    if !self.poke(dst + 4 * k, val) {
                        return Exec::Fault;
                    }
                }
                Exec::Done
            }
            dma::INDIRECT_BUFFER => {
                let ib = u64::from(words[1]) | (u64::from(words[2] & 0xff) << 32);
                self.exec_indirect(st, RingKind::Dma, ib, words[2] >> 16);
                Exec::Done
            }
            dma::SEMAPHORE => {
                let signal = (header >> 22) & 1 != 0;
                self.semaphore(addr(1, 2) & !7, !signal)
            }
            dma::FENCE => {
                if self.poke(addr(1, 2) & !3, words[3]) {
                    Exec::Done
                } else {
                    Exec::Fault
                }
            }
            dma::TRAP => {
                let cntl = st.regs.get(&r600::CP_INT_CNTL).copied().unwrap_or(0);
                if cntl & r600::RB_INT_ENABLE != 0 {
                    self.raise(IrqSource::Ring(DMA_RING));
                }
                Exec::Done
            }
            dma::NOP => Exec::Done,
            _ => Exec::Fault,
        }
    }
}

impl RegisterFile for SimGpu {
    fn read(&self, reg: u32) -> u32 {
        let st = self.state.lock();
        self.read_reg(&st, reg)
    }

    fn write(&self, reg: u32, val: u32) {
        let mut st = self.state.lock();
        self.write_reg(&mut st, reg, val, false);
    }
}

impl DmaAllocator for SimGpu {
    fn alloc(&self, words: usize) -> Result<Arc<DmaRegion>> {
        let region = self.gart.alloc(words)?;
        let mut regions = self.regions.lock();
        regions.retain(|weak| weak.strong_count() > 0);
        regions.push(Arc::downgrade(&region));
        Ok(region)
    }

    fn free(&self, region: &DmaRegion) {
        self.gart.free(region);
        self.regions
            .lock()
            .retain(|weak| weak.upgrade().map_or(false, |r| r.bus_addr() != region.bus_addr()));
    }
}
