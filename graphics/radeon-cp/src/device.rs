// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! One Radeon device and its command processor
//!
//! [`Device`] owns everything with device lifetime (register window, DMA
//! allocator, fence driver, interrupt queue, counters). The command
//! processor state created by `cp_init` lives behind the hardware lock and
//! is only reachable through a [`HwGuard`].

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::asic::{self, Asic};
use crate::clock::Clock;
use crate::config::{check_ring_size, DriverConfig, Family, MAX_USEC_TIMEOUT};
use crate::dma::{DmaAllocator, DmaRegion};
use crate::fence::{Fence, FenceDriver, FenceLocation, RingStatus, WaitStatus};
use crate::fifo;
use crate::freelist::{Freelist, Pid};
use crate::irq::{IrqLine, IrqSource};
use crate::regs::RegisterFile;
use crate::ring::RingBuffer;
use crate::sarea::{Sarea, SCRATCH_FENCE, SCRATCH_LAST_CLEAR, SCRATCH_LAST_DISPATCH, SCRATCH_LAST_FRAME};
use crate::semaphore::SemaphorePool;
use crate::stats::CpStats;
use crate::{Error, Result};

/// Writeback page layout, in words
pub const WB_RPTR: usize = 0;
pub const WB_SCRATCH: usize = 64;
pub const WB_FENCE: usize = 128;
const WB_WORDS: usize = 1024;

/// Command processor setup requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpInitParams {
    /// Ring size in words, a power of two
    pub ring_size: u32,
    pub usec_timeout: u32,
    pub buffer_count: usize,
    /// Bytes per DMA buffer
    pub buffer_size: usize,
    /// Mirror read pointers and scratch registers into memory
    pub writeback: bool,
}

impl CpInitParams {
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            ring_size: config.ring_size_words,
            usec_timeout: config.usec_timeout,
            buffer_count: config.buffer_count,
            buffer_size: config.buffer_size,
            writeback: config.use_writeback,
        }
    }

    fn validate(&self) -> Result<()> {
        check_ring_size(self.ring_size)?;
        if self.usec_timeout == 0 || self.usec_timeout > MAX_USEC_TIMEOUT {
            return Err(Error::InvalidArgument("usec_timeout out of range"));
        }
        if self.buffer_count == 0 || self.buffer_size == 0 || self.buffer_size % 4 != 0 {
            return Err(Error::InvalidArgument("buffer geometry"));
        }
        Ok(())
    }
}

/// Command processor state, exists between `cp_init` and `cp_cleanup`
pub(crate) struct Cp {
    pub(crate) rings: Vec<RingBuffer>,
    pub(crate) freelist: Freelist,
    pub(crate) semaphores: SemaphorePool,
    pub(crate) usec_timeout: u32,
    pub(crate) running: bool,
    /// Newest fence per ring, what other rings sync against
    pub(crate) last_fence: Vec<Option<Fence>>,
    writeback: Arc<DmaRegion>,
    sem_region: Arc<DmaRegion>,
    use_writeback: bool,
}

impl Cp {
    pub(crate) fn ring_mut(&mut self, ring: usize) -> Result<&mut RingBuffer> {
        self.rings
            .get_mut(ring)
            .ok_or(Error::InvalidArgument("no such ring"))
    }

    /// Refuse further reservations on `ring` until it is restarted
    pub(crate) fn disable_ring(&mut self, ring: usize) {
        if let Some(ring) = self.rings.get_mut(ring) {
            ring.set_ready(false);
        }
    }

    fn regions(&self) -> Vec<Arc<DmaRegion>> {
        let mut regions: Vec<_> = self.rings.iter().map(|ring| ring.memory().clone()).collect();
        regions.push(self.freelist.region().clone());
        regions.push(self.sem_region.clone());
        regions.push(self.writeback.clone());
        regions
    }
}

/// A Radeon device
pub struct Device {
    regs: Arc<dyn RegisterFile>,
    dma: Arc<dyn DmaAllocator>,
    clock: Arc<dyn Clock>,
    asic: Box<dyn Asic>,
    config: DriverConfig,
    fences: Arc<FenceDriver>,
    stats: Arc<CpStats>,
    irq: Arc<IrqLine>,
    sarea: Sarea,
    /// Scratch mirror while writeback is on
    scratch_wb: RwLock<Option<Arc<DmaRegion>>>,
    hw: Mutex<Option<Cp>>,
}

impl Device {
    pub fn new(
        regs: Arc<dyn RegisterFile>,
        dma: Arc<dyn DmaAllocator>,
        clock: Arc<dyn Clock>,
        config: DriverConfig,
    ) -> Result<Self> {
        config.validate()?;
        let asic = asic::for_family(config.family);
        let stats = Arc::new(CpStats::new());
        let fences = Arc::new(FenceDriver::new(
            regs.clone(),
            clock.clone(),
            stats.clone(),
            asic.num_rings(),
            config.lockup_timeout,
            config.fence_poll_interval,
        ));
        log::info!(
            "radeon: {} device, {} ring(s)",
            asic.name(),
            asic.num_rings()
        );

        Ok(Self {
            regs,
            dma,
            clock,
            irq: Arc::new(IrqLine::new(config.irq_queue_depth)),
            asic,
            config,
            fences,
            stats,
            sarea: Sarea::new(),
            scratch_wb: RwLock::new(None),
            hw: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn asic(&self) -> &dyn Asic {
        &*self.asic
    }

    pub fn regs(&self) -> &Arc<dyn RegisterFile> {
        &self.regs
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn fences(&self) -> &Arc<FenceDriver> {
        &self.fences
    }

    pub fn stats(&self) -> &Arc<CpStats> {
        &self.stats
    }

    /// Interrupt queue the hardware interrupt handler feeds
    pub fn irq(&self) -> &Arc<IrqLine> {
        &self.irq
    }

    /// Counters as handed out to clients
    pub fn sarea(&self) -> &Sarea {
        &self.sarea
    }

    /// Take the hardware lock on behalf of `pid`
    pub fn lock(&self, pid: Pid) -> HwGuard<'_> {
        HwGuard {
            dev: self,
            pid,
            cp: self.hw.lock(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.hw.lock().is_some()
    }

    /// Read scratch register `index`, from the writeback mirror if enabled
    pub(crate) fn read_scratch(&self, index: u32) -> u32 {
        match self.scratch_wb.read().as_ref() {
            Some(wb) => wb.read(WB_SCRATCH + index as usize),
            None => self.regs.read(self.asic.scratch_reg(index)),
        }
    }

    /// Age of the last buffer the hardware has finished with
    pub fn last_dispatch(&self) -> u32 {
        self.read_scratch(SCRATCH_LAST_DISPATCH)
    }

    /// Last completed clear
    pub fn last_clear(&self) -> u32 {
        self.read_scratch(SCRATCH_LAST_CLEAR)
    }

    /// Last completed swap
    pub fn last_frame(&self) -> u32 {
        self.read_scratch(SCRATCH_LAST_FRAME)
    }

    /// Wait for fence `seq` of `ring` without the hardware lock
    ///
    /// A lockup found by the wait takes the ring out of service right away.
    pub fn wait_fence(&self, ring: usize, seq: u64, interruptible: bool) -> Result<WaitStatus> {
        let result = self.fences.wait_seq(ring, seq, interruptible);
        if let Err(Error::Lockup { ring, .. }) = result {
            if let Some(cp) = self.hw.lock().as_mut() {
                cp.disable_ring(ring);
            }
        }
        result
    }

    /// Drain the interrupt queue and update the fences it points at,
    /// returns the number of events handled
    pub fn service_interrupts(&self) -> usize {
        let status = self.asic.irq_ack(&*self.regs);
        let events = self.irq.drain();
        let mut rings = vec![false; self.asic.num_rings()];

        for event in &events {
            self.stats.record_interrupt();
            match *event {
                IrqSource::Ring(ring) => {
                    if let Some(seen) = rings.get_mut(ring) {
                        *seen = true;
                    }
                }
                IrqSource::Other(bits) => {
                    log::debug!("radeon: unhandled interrupt {:#010x}", bits);
                }
            }
        }
        if status != 0 && events.is_empty() {
            // Status without a queued event, check everything.
            rings.iter_mut().for_each(|seen| *seen = true);
        }

        for (ring, seen) in rings.into_iter().enumerate() {
            if seen {
                self.fences.process(ring);
            }
        }
        events.len()
    }

    /// Release every waiter and tear the command processor down
    pub fn shutdown(&self) {
        self.fences.force_completion();
        let mut guard = self.lock(0);
        if guard.cp.is_some() {
            if let Err(err) = guard.cp_cleanup() {
                log::error!("radeon: cleanup during shutdown failed: {}", err);
            }
        }
        self.fences.fini();
        log::info!("radeon: shut down");
    }

    fn fence_location(&self, ring: usize, wb: &Arc<DmaRegion>, writeback: bool) -> FenceLocation {
        match self.asic.family() {
            Family::R100 => FenceLocation::Scratch {
                reg: self.asic.scratch_reg(SCRATCH_FENCE),
                mirror: writeback.then(|| (wb.clone(), WB_SCRATCH + SCRATCH_FENCE as usize)),
            },
            Family::R600 => FenceLocation::Memory {
                region: wb.clone(),
                index: WB_FENCE + ring,
            },
        }
    }

    fn build_cp(&self, params: &CpInitParams, allocated: &mut Vec<Arc<DmaRegion>>) -> Result<Cp> {
        let mut alloc = |words: usize| -> Result<Arc<DmaRegion>> {
            let region = self.dma.alloc(words)?;
            allocated.push(region.clone());
            Ok(region)
        };

        let writeback = alloc(WB_WORDS)?;

        let mut rings = Vec::with_capacity(self.asic.num_rings());
        for id in 0..self.asic.num_rings() {
            let desc = self.asic.ring_desc(id);
            let mut ring = RingBuffer::new(
                id,
                desc.kind,
                alloc(params.ring_size as usize)?,
                self.regs.clone(),
                self.clock.clone(),
                desc.layout,
                desc.align_mask,
                desc.nop,
            )?;
            if params.writeback && desc.layout.rptr_addr.is_some() {
                ring.set_head_writeback(writeback.clone(), WB_RPTR + id);
            }
            rings.push(ring);
        }

        let buffers = alloc(params.buffer_count * params.buffer_size / 4)?;
        let freelist = Freelist::new(
            buffers,
            params.buffer_count,
            params.buffer_size,
            self.config.rotate_freelist,
        )?;

        let sem_region = alloc(self.config.semaphore_slots.max(1) * 2)?;

        Ok(Cp {
            last_fence: vec![None; rings.len()],
            rings,
            freelist,
            semaphores: SemaphorePool::new(sem_region.clone()),
            usec_timeout: params.usec_timeout,
            running: false,
            writeback,
            sem_region,
            use_writeback: params.writeback,
        })
    }
}

/// Holder of the hardware lock
///
/// Only the holder writes ring tails, walks the freelist or touches the
/// command processor registers.
pub struct HwGuard<'a> {
    pub(crate) dev: &'a Device,
    pub(crate) pid: Pid,
    cp: MutexGuard<'a, Option<Cp>>,
}

impl<'a> HwGuard<'a> {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn device(&self) -> &'a Device {
        self.dev
    }

    pub(crate) fn cp_mut(&mut self) -> Result<&mut Cp> {
        self.cp.as_mut().ok_or(Error::NotInitialized)
    }

    fn cp_ref(&self) -> Result<&Cp> {
        self.cp.as_ref().ok_or(Error::NotInitialized)
    }

    pub fn is_running(&self) -> bool {
        self.cp.as_ref().map_or(false, |cp| cp.running)
    }

    /// Ring `ring`, for inspection
    pub fn ring(&self, ring: usize) -> Result<&RingBuffer> {
        self.cp_ref()?
            .rings
            .get(ring)
            .ok_or(Error::InvalidArgument("no such ring"))
    }

    pub fn freelist(&self) -> Result<&Freelist> {
        Ok(&self.cp_ref()?.freelist)
    }

    pub fn semaphores(&self) -> Result<&SemaphorePool> {
        Ok(&self.cp_ref()?.semaphores)
    }

    /// Newest fence emitted on `ring`
    pub fn last_fence(&self, ring: usize) -> Option<Fence> {
        self.cp.as_ref()?.last_fence.get(ring)?.clone()
    }

    /// Allocate rings, buffers and writeback memory and program the ring
    /// registers, leaving the command processor stopped
    pub fn cp_init(&mut self, params: CpInitParams) -> Result<()> {
        if self.cp.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        params.validate()?;
        let dev = self.dev;
        let regs = &*dev.regs;
        let asic = &*dev.asic;

        let mut allocated = Vec::new();
        let cp = match dev.build_cp(&params, &mut allocated) {
            Ok(cp) => cp,
            Err(err) => {
                for region in &allocated {
                    dev.dma.free(region);
                }
                log::error!("radeon: CP init failed: {}", err);
                return Err(err);
            }
        };

        asic.cp_stop(regs);
        let scratch_addr = params.writeback.then(|| cp.writeback.addr_of(WB_SCRATCH));
        asic.scratch_writeback(regs, scratch_addr);

        for index in [SCRATCH_LAST_FRAME, SCRATCH_LAST_DISPATCH, SCRATCH_LAST_CLEAR] {
            regs.write(asic.scratch_reg(index), 0);
            cp.writeback.write(WB_SCRATCH + index as usize, 0);
        }
        dev.sarea.reset();

        for ring in &cp.rings {
            let rptr_wb = (params.writeback && ring.layout().rptr_addr.is_some())
                .then(|| cp.writeback.addr_of(WB_RPTR + ring.id()));
            asic.ring_start(regs, ring, rptr_wb);
            let location = dev.fence_location(ring.id(), &cp.writeback, params.writeback);
            dev.fences.init_ring(ring.id(), location)?;
        }

        *dev.scratch_wb.write() = params.writeback.then(|| cp.writeback.clone());
        asic.irq_enable(regs, true);

        log::info!(
            "radeon: CP initialized, {} word ring(s), {} x {} byte buffers, writeback {}",
            params.ring_size,
            params.buffer_count,
            params.buffer_size,
            if params.writeback { "on" } else { "off" }
        );
        *self.cp = Some(cp);
        Ok(())
    }

    /// Stop the command processor and release everything `cp_init` set up
    pub fn cp_cleanup(&mut self) -> Result<()> {
        let dev = self.dev;
        let cp = self.cp.take().ok_or(Error::NotInitialized)?;
        let regs = &*dev.regs;

        dev.asic.irq_enable(regs, false);
        dev.asic.cp_stop(regs);
        dev.asic.scratch_writeback(regs, None);
        *dev.scratch_wb.write() = None;

        // Nothing may be left waiting on rings that are about to go away.
        dev.fences.force_completion();
        for region in cp.regions() {
            dev.dma.free(&region);
        }
        log::info!("radeon: CP cleaned up");
        Ok(())
    }

    pub fn cp_start(&mut self) -> Result<()> {
        let dev = self.dev;
        let cp = self.cp_mut()?;
        if cp.running {
            log::debug!("radeon: CP already running");
            return Ok(());
        }
        dev.asic.cp_start(&*dev.regs);
        for ring in cp.rings.iter_mut() {
            ring.set_ready(true);
        }
        cp.running = true;
        log::info!("radeon: CP started");
        Ok(())
    }

    /// Halt the command processor, after draining it when `idle` is set
    pub fn cp_stop(&mut self, idle: bool) -> Result<()> {
        if idle && self.is_running() {
            self.cp_idle()?;
        }
        let dev = self.dev;
        let cp = self.cp_mut()?;
        dev.asic.cp_stop(&*dev.regs);
        for ring in cp.rings.iter_mut() {
            ring.set_ready(false);
        }
        cp.running = false;
        log::info!("radeon: CP stopped");
        Ok(())
    }

    /// Drop everything queued on the rings
    pub fn cp_reset(&mut self) -> Result<()> {
        let cp = self.cp_mut()?;
        for ring in cp.rings.iter_mut() {
            ring.reset();
            ring.set_ready(false);
        }
        cp.running = false;
        log::info!("radeon: CP reset");
        Ok(())
    }

    /// Wait until the command processor has executed everything queued
    pub fn cp_idle(&mut self) -> Result<()> {
        self.cp_ref()?;
        self.wait_for_idle()
    }

    /// Let the rings run dry, then drain the FIFO, wait for the engines and
    /// flush the caches
    ///
    /// A locked-up ring fails with [`Error::RingNotReady`]; a ring that
    /// stops completing fences during the wait fails with [`Error::Lockup`].
    pub fn wait_for_idle(&mut self) -> Result<()> {
        let dev = self.dev;
        let (usec, rings, running) = match self.cp.as_ref() {
            Some(cp) => (cp.usec_timeout, cp.rings.len(), cp.running),
            None => (dev.config.usec_timeout, 0, false),
        };

        for ring in 0..rings {
            self.check_ring(ring)?;
        }
        if running {
            for ring in 0..rings {
                if let Err(err) = dev.fences.wait_empty(ring) {
                    if matches!(err, Error::Lockup { .. }) {
                        self.cp_mut()?.disable_ring(ring);
                    }
                    return Err(err);
                }
            }
        }
        fifo::wait_for_idle(&*dev.regs, &*dev.asic, &*dev.clock, usec)
    }

    /// Fail fast on a ring the fence code has given up on
    pub(crate) fn check_ring(&mut self, ring: usize) -> Result<()> {
        match self.dev.fences.status(ring) {
            RingStatus::Ready => Ok(()),
            RingStatus::LockedUp => {
                self.cp_mut()?.disable_ring(ring);
                Err(Error::RingNotReady { ring })
            }
            RingStatus::Uninitialized => Err(Error::NotInitialized),
        }
    }

    /// Soft reset the engines after a lockup
    ///
    /// Queued work is discarded, its fences are completed, locked-up rings
    /// become usable again and every pending buffer is reclaimable. The
    /// command processor is left stopped.
    pub fn engine_reset(&mut self) -> Result<()> {
        let dev = self.dev;
        let cp = self.cp_mut()?;
        let regs = &*dev.regs;

        dev.asic.cp_stop(regs);
        dev.asic.soft_reset(regs, &*dev.clock);

        for ring in cp.rings.iter_mut() {
            ring.reset();
            ring.set_ready(false);
            dev.fences.complete_ring(ring.id())?;
            dev.fences.reset_ring(ring.id())?;
        }
        cp.freelist.reset_all();
        cp.running = false;

        dev.stats.record_engine_reset();
        log::info!("radeon: engine reset");
        Ok(())
    }

    /// Make `dst` wait on the GPU for `fence` before anything submitted to
    /// it afterwards
    ///
    /// Uses a hardware semaphore; if every semaphore is in flight the CPU
    /// waits for the fence instead.
    pub fn sync_rings(&mut self, fence: &Fence, dst: usize) -> Result<()> {
        let dev = self.dev;
        if !dev.fences.need_sync(Some(fence), dst) {
            return Ok(());
        }
        if fence.signaled() {
            dev.fences.note_sync(Some(fence), dst);
            return Ok(());
        }
        // A wait on a hung ring would never be released.
        self.check_ring(fence.ring())?;
        self.check_ring(dst)?;

        let cp = self.cp_mut()?;
        let usec = cp.usec_timeout;
        let sem = match cp.semaphores.alloc() {
            Ok(sem) => sem,
            Err(Error::Busy) => {
                log::debug!("radeon: no free semaphore, waiting on {:?}", fence);
                fence.wait(false)?;
                dev.fences.note_sync(Some(fence), dst);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let asic = &*dev.asic;
        let signal = (|| -> Result<()> {
            let ring = cp.ring_mut(fence.ring())?;
            ring.reserve(asic.semaphore_dw(fence.ring()), usec)?;
            if let Err(err) = asic.emit_semaphore(ring, sem.gpu_addr(), false) {
                ring.undo();
                return Err(err);
            }
            ring.commit();
            Ok(())
        })();
        if let Err(err) = signal {
            cp.semaphores.free(sem, None);
            return Err(err);
        }

        let wait = (|| -> Result<Fence> {
            let ring = cp.ring_mut(dst)?;
            ring.reserve(asic.semaphore_dw(dst) + asic.fence_dw(dst), usec)?;
            let fence = asic
                .emit_semaphore(ring, sem.gpu_addr(), true)
                .and_then(|()| dev.fences.emit(ring, asic));
            match fence {
                Ok(fence) => {
                    ring.commit();
                    Ok(fence)
                }
                Err(err) => {
                    ring.undo();
                    Err(err)
                }
            }
        })();
        match wait {
            Ok(released) => {
                cp.semaphores.free(sem, Some(released.clone()));
                cp.last_fence[dst] = Some(released);
                dev.fences.note_sync(Some(fence), dst);
                Ok(())
            }
            Err(err) => {
                log::error!("radeon: semaphore wait on ring {} failed: {}", dst, err);
                cp.semaphores.free(sem, None);
                Err(err)
            }
        }
    }

    /// Whether `cp_init` turned read pointer and scratch writeback on
    pub fn uses_writeback(&self) -> Result<bool> {
        Ok(self.cp_ref()?.use_writeback)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.hw.get_mut().is_some() {
            self.fences.force_completion();
            let mut guard = self.lock(0);
            if let Err(err) = guard.cp_cleanup() {
                log::error!("radeon: cleanup on drop failed: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asic::GFX_RING;
    use crate::sim::{ManualClock, SimGpu};

    const GART: u64 = 0x4000_0000;

    fn sim_device(family: Family) -> (Arc<SimGpu>, Device) {
        let sim = Arc::new(SimGpu::new(family, GART, 16 << 20));
        let config = DriverConfig {
            family,
            buffer_count: 4,
            buffer_size: 4096,
            ..DriverConfig::default()
        };
        let dev = Device::new(sim.clone(), sim.clone(), Arc::new(ManualClock::new()), config).unwrap();
        sim.attach_irq(dev.irq().clone());
        (sim, dev)
    }

    fn params(dev: &Device) -> CpInitParams {
        CpInitParams {
            ring_size: 1024,
            ..CpInitParams::from_config(dev.config())
        }
    }

    #[test]
    fn test_init_and_cleanup() {
        let (sim, dev) = sim_device(Family::R100);
        let mut hw = dev.lock(1);
        hw.cp_init(params(&dev)).unwrap();
        assert_eq!(hw.cp_init(params(&dev)), Err(Error::AlreadyInitialized));
        assert!(sim.is_halted());
        assert_eq!(dev.fences().status(GFX_RING), RingStatus::Ready);

        hw.cp_start().unwrap();
        assert!(!sim.is_halted());
        assert!(hw.ring(GFX_RING).unwrap().is_ready());

        hw.cp_cleanup().unwrap();
        assert_eq!(hw.cp_start(), Err(Error::NotInitialized));
        assert!(sim.is_halted());
    }

    #[test]
    fn test_bad_init_params() {
        let (_sim, dev) = sim_device(Family::R100);
        let mut hw = dev.lock(1);
        let bad = CpInitParams {
            ring_size: 1000,
            ..params(&dev)
        };
        assert!(matches!(hw.cp_init(bad), Err(Error::InvalidArgument(_))));
        assert!(!hw.is_running());
    }

    #[test]
    fn test_r600_has_two_rings() {
        let (_sim, dev) = sim_device(Family::R600);
        let mut hw = dev.lock(1);
        hw.cp_init(params(&dev)).unwrap();
        hw.cp_start().unwrap();
        assert!(hw.ring(asic::DMA_RING).unwrap().is_ready());
        assert_eq!(dev.fences().status(asic::DMA_RING), RingStatus::Ready);
    }

    #[test]
    fn test_stop_and_reset() {
        let (_sim, dev) = sim_device(Family::R100);
        let mut hw = dev.lock(1);
        hw.cp_init(params(&dev)).unwrap();
        hw.cp_start().unwrap();
        hw.cp_stop(true).unwrap();
        assert!(!hw.is_running());
        assert_eq!(
            hw.cp_mut().unwrap().ring_mut(GFX_RING).unwrap().reserve(4, 10),
            Err(Error::RingNotReady { ring: GFX_RING })
        );

        hw.cp_reset().unwrap();
        hw.cp_start().unwrap();
        assert!(hw.is_running());
    }

    #[test]
    fn test_idle_times_out_when_busy() {
        let (sim, dev) = sim_device(Family::R100);
        let mut hw = dev.lock(1);
        hw.cp_init(CpInitParams {
            usec_timeout: 50,
            ..params(&dev)
        })
        .unwrap();
        sim.set_busy(true);
        assert_eq!(hw.cp_idle(), Err(Error::Busy));
        sim.set_busy(false);
        assert_eq!(hw.cp_idle(), Ok(()));
    }

    #[test]
    fn test_drop_releases_cp() {
        let (sim, dev) = sim_device(Family::R600);
        let free = sim.gart_available();
        dev.lock(1).cp_init(params(&dev)).unwrap();
        dev.lock(1).cp_start().unwrap();
        assert!(sim.gart_available() < free);

        drop(dev);
        assert!(sim.is_halted());
        assert_eq!(sim.gart_available(), free);
    }

    #[test]
    fn test_shutdown_releases_cp() {
        let (_sim, dev) = sim_device(Family::R100);
        dev.lock(1).cp_init(params(&dev)).unwrap();
        dev.shutdown();
        assert!(!dev.is_initialized());
        assert!(dev.fences().is_shut_down());
    }
}
