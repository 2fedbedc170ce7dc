// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use radeon_cp::regs::{r100, ClearFlags};
use radeon_cp::sim::{ManualClock, SimGpu};
use radeon_cp::submit::{Clear, Rect};
use radeon_cp::{
    Clock, CpInitParams, Device, DmaAllocator, DriverConfig, Family, Ioctl, MonotonicClock, Param,
    Reply, WaitStatus,
};

const GART: u64 = 0x4000_0000;

fn config(family: Family) -> DriverConfig {
    DriverConfig {
        family,
        ring_size_words: 1024,
        buffer_count: 2,
        buffer_size: 4096,
        usec_timeout: 100,
        ..DriverConfig::default()
    }
}

fn bring_up(sim: &Arc<SimGpu>, clock: Arc<dyn Clock>, config: DriverConfig) -> Device {
    let dev = Device::new(sim.clone(), sim.clone(), clock, config).unwrap();
    sim.attach_irq(dev.irq().clone());
    let params = CpInitParams::from_config(dev.config());
    assert_eq!(dev.ioctl(1, Ioctl::CpInit(params)), Ok(Reply::Done));
    assert_eq!(dev.ioctl(1, Ioctl::CpStart), Ok(Reply::Done));
    dev
}

fn fenced(reply: Reply) -> (usize, u64) {
    match reply {
        Reply::Fence { ring, seq } => (ring, seq),
        other => panic!("expected a fence, got {:?}", other),
    }
}

/// Device whose rings give up after 10ms without progress
fn quick_lockup(sim: &Arc<SimGpu>, family: Family) -> Device {
    bring_up(
        sim,
        Arc::new(MonotonicClock::new()),
        DriverConfig {
            lockup_timeout: Duration::from_millis(10),
            fence_poll_interval: Duration::from_millis(2),
            ..config(family)
        },
    )
}

fn errno(result: syscall::Result<Reply>) -> i32 {
    result.unwrap_err().errno
}

fn wait(dev: &Device, ring: usize, seq: u64) -> syscall::Result<Reply> {
    dev.ioctl(
        1,
        Ioctl::FenceWait {
            ring,
            seq,
            interruptible: false,
        },
    )
}

#[test]
fn test_buffers_come_back_once_aged() {
    let sim = Arc::new(SimGpu::new(Family::R100, GART, 16 << 20));
    let dev = bring_up(&sim, Arc::new(ManualClock::new()), config(Family::R100));

    let Ok(Reply::Buffers(grants)) = dev.ioctl(7, Ioctl::GetBuffers { count: 2 }) else {
        panic!("no buffers");
    };
    assert_eq!(grants.len(), 2);

    sim.set_auto_run(false);
    for grant in &grants {
        fenced(dev.ioctl(7, Ioctl::Discard { index: grant.index }).unwrap());
    }

    // Both are pending until the GPU reaches their age.
    let err = dev.ioctl(7, Ioctl::GetBuffers { count: 1 }).unwrap_err();
    assert_eq!(err.errno, syscall::ENOMEM);

    sim.run();
    assert_eq!(
        dev.ioctl(7, Ioctl::GetParam(Param::LastDispatch)),
        Ok(Reply::Value(u64::from(dev.sarea().last_dispatch())))
    );
    let Ok(Reply::Buffers(again)) = dev.ioctl(8, Ioctl::GetBuffers { count: 2 }) else {
        panic!("buffers not reclaimed");
    };
    assert_eq!(again.len(), 2);
}

#[test]
fn test_lockup_then_engine_reset() {
    let sim = Arc::new(SimGpu::new(Family::R100, GART, 16 << 20));
    let dev = bring_up(
        &sim,
        Arc::new(MonotonicClock::new()),
        DriverConfig {
            lockup_timeout: Duration::from_millis(10),
            fence_poll_interval: Duration::from_millis(2),
            ..config(Family::R100)
        },
    );

    sim.hang(0);
    let (ring, seq) = fenced(
        dev.ioctl(1, Ioctl::State(vec![(r100::SE_VTX_FMT, 1)]))
            .unwrap(),
    );
    assert_eq!(wait(&dev, ring, seq).unwrap_err().errno, syscall::EDEADLK);
    assert_eq!(wait(&dev, ring, seq).unwrap_err().errno, syscall::ENODEV);
    assert_eq!(
        dev.ioctl(1, Ioctl::State(vec![(r100::SE_VTX_FMT, 2)]))
            .unwrap_err()
            .errno,
        syscall::ENODEV
    );

    assert_eq!(dev.ioctl(1, Ioctl::EngineReset), Ok(Reply::Done));
    assert_eq!(sim.soft_resets(), 1);
    assert_eq!(wait(&dev, ring, seq), Ok(Reply::Wait(WaitStatus::Signaled)));

    assert_eq!(dev.ioctl(1, Ioctl::CpStart), Ok(Reply::Done));
    let (ring, seq) = fenced(
        dev.ioctl(1, Ioctl::State(vec![(r100::SE_VTX_FMT, 3)]))
            .unwrap(),
    );
    assert_eq!(wait(&dev, ring, seq), Ok(Reply::Wait(WaitStatus::Signaled)));
    assert_eq!(radeon_cp::RegisterFile::read(&*sim, r100::SE_VTX_FMT), 3);
}

#[test]
fn test_idle_after_lockup_fails_hard() {
    let sim = Arc::new(SimGpu::new(Family::R100, GART, 16 << 20));
    let dev = quick_lockup(&sim, Family::R100);

    sim.hang(0);
    let (ring, seq) = fenced(
        dev.ioctl(1, Ioctl::State(vec![(r100::SE_VTX_FMT, 1)]))
            .unwrap(),
    );
    assert_eq!(errno(wait(&dev, ring, seq)), syscall::EDEADLK);
    assert!(!dev.lock(1).ring(0).unwrap().is_ready());

    assert_eq!(errno(dev.ioctl(1, Ioctl::WaitIdle)), syscall::ENODEV);
    assert_eq!(errno(dev.ioctl(1, Ioctl::CpIdle)), syscall::ENODEV);
    assert_eq!(errno(dev.ioctl(1, Ioctl::CpStop { idle: true })), syscall::ENODEV);

    assert_eq!(dev.ioctl(1, Ioctl::EngineReset), Ok(Reply::Done));
    assert_eq!(dev.ioctl(1, Ioctl::CpStart), Ok(Reply::Done));
    assert_eq!(dev.ioctl(1, Ioctl::WaitIdle), Ok(Reply::Done));
}

#[test]
fn test_idle_wait_detects_lockup() {
    let sim = Arc::new(SimGpu::new(Family::R100, GART, 16 << 20));
    let dev = quick_lockup(&sim, Family::R100);

    sim.hang(0);
    fenced(
        dev.ioctl(1, Ioctl::State(vec![(r100::SE_VTX_FMT, 1)]))
            .unwrap(),
    );
    assert_eq!(errno(dev.ioctl(1, Ioctl::CpIdle)), syscall::EDEADLK);
    assert_eq!(errno(dev.ioctl(1, Ioctl::WaitIdle)), syscall::ENODEV);
    assert_eq!(dev.stats().snapshot().lockups, 1);
}

#[test]
fn test_copy_refused_behind_locked_graphics_ring() {
    let sim = Arc::new(SimGpu::new(Family::R600, GART, 16 << 20));
    let dev = quick_lockup(&sim, Family::R600);
    let src = sim.alloc(16).unwrap();
    let dst = sim.alloc(16).unwrap();
    src.write(0, 0x5a5a);

    sim.hang(0);
    let (ring, seq) = fenced(
        dev.ioctl(1, Ioctl::State(vec![(r100::SE_VTX_FMT, 1)]))
            .unwrap(),
    );
    assert_eq!(errno(wait(&dev, ring, seq)), syscall::EDEADLK);

    let tails = |dev: &Device| {
        let hw = dev.lock(0);
        (hw.ring(0).unwrap().tail(), hw.ring(1).unwrap().tail())
    };
    let before = tails(&dev);
    let copy = Ioctl::Copy {
        src: src.bus_addr(),
        dst: dst.bus_addr(),
        words: 16,
    };
    assert_eq!(errno(dev.ioctl(1, copy)), syscall::ENODEV);
    assert_eq!(tails(&dev), before);
    assert_eq!(dev.lock(0).semaphores().unwrap().in_use(), 0);
    assert_eq!(dst.read(0), 0);
    assert_eq!(
        dev.ioctl(1, Ioctl::GetParam(Param::LastEmitted(1))),
        Ok(Reply::Value(0))
    );
}

#[test]
fn test_rejected_clear_leaves_counters() {
    let sim = Arc::new(SimGpu::new(Family::R100, GART, 16 << 20));
    let dev = quick_lockup(&sim, Family::R100);
    let clear = Clear {
        flags: ClearFlags::BACK,
        color: 0xff,
        color_mask: 0xffff_ffff,
        rects: vec![Rect { x: 0, y: 0, w: 16, h: 16 }],
        ..Clear::default()
    };

    sim.hang(0);
    let (ring, seq) = fenced(
        dev.ioctl(1, Ioctl::State(vec![(r100::SE_VTX_FMT, 1)]))
            .unwrap(),
    );
    assert_eq!(errno(wait(&dev, ring, seq)), syscall::EDEADLK);

    assert_eq!(errno(dev.ioctl(1, Ioctl::Clear(clear.clone()))), syscall::ENODEV);
    assert_eq!(dev.sarea().last_clear(), 0);
    assert_eq!(
        dev.ioctl(1, Ioctl::GetParam(Param::LastClear)),
        Ok(Reply::Value(0))
    );

    assert_eq!(dev.ioctl(1, Ioctl::EngineReset), Ok(Reply::Done));
    assert_eq!(dev.ioctl(1, Ioctl::CpStart), Ok(Reply::Done));
    let (ring, seq) = fenced(dev.ioctl(1, Ioctl::Clear(clear)).unwrap());
    assert_eq!(wait(&dev, ring, seq), Ok(Reply::Wait(WaitStatus::Signaled)));
    assert_eq!(dev.sarea().last_clear(), 1);
    assert_eq!(
        dev.ioctl(1, Ioctl::GetParam(Param::LastClear)),
        Ok(Reply::Value(1))
    );
}

#[test]
fn test_shutdown_releases_waiters() {
    let sim = Arc::new(SimGpu::new(Family::R100, GART, 16 << 20));
    let dev = Arc::new(bring_up(
        &sim,
        Arc::new(MonotonicClock::new()),
        DriverConfig {
            lockup_timeout: Duration::from_secs(60),
            fence_poll_interval: Duration::from_millis(2),
            ..config(Family::R100)
        },
    ));

    sim.hang(0);
    let (ring, seq) = fenced(
        dev.ioctl(1, Ioctl::State(vec![(r100::SE_VTX_FMT, 1)]))
            .unwrap(),
    );
    let waiter = {
        let dev = dev.clone();
        thread::spawn(move || wait(&dev, ring, seq))
    };
    thread::sleep(Duration::from_millis(20));
    dev.shutdown();

    assert_eq!(
        waiter.join().unwrap(),
        Ok(Reply::Wait(WaitStatus::ForceCompleted))
    );
    assert!(!dev.is_initialized());
    assert!(sim.is_halted());
}

#[test]
fn test_r600_copy_after_graphics() {
    let sim = Arc::new(SimGpu::new(Family::R600, GART, 16 << 20));
    let dev = bring_up(&sim, Arc::new(ManualClock::new()), config(Family::R600));
    assert_eq!(dev.ioctl(1, Ioctl::GetParam(Param::NumRings)), Ok(Reply::Value(2)));

    let src = sim.alloc(32).unwrap();
    let dst = sim.alloc(32).unwrap();
    for i in 0..32 {
        src.write(i, 0xabc0 + i as u32);
    }

    sim.set_auto_run(false);
    let gfx = fenced(
        dev.ioctl(1, Ioctl::State(vec![(r100::SE_VTX_FMT, 9)]))
            .unwrap(),
    );
    let copy = fenced(
        dev.ioctl(
            1,
            Ioctl::Copy {
                src: src.bus_addr(),
                dst: dst.bus_addr(),
                words: 32,
            },
        )
        .unwrap(),
    );
    assert_eq!(gfx.0, 0);
    assert_eq!(copy.0, 1);
    assert_eq!(dst.read(0), 0);

    sim.run();
    assert_eq!(wait(&dev, copy.0, copy.1), Ok(Reply::Wait(WaitStatus::Signaled)));
    assert_eq!(wait(&dev, gfx.0, gfx.1), Ok(Reply::Wait(WaitStatus::Signaled)));
    assert_eq!(dst.read(31), 0xabc0 + 31);
}

#[test]
fn test_requests_before_init_fail() {
    let sim = Arc::new(SimGpu::new(Family::R100, GART, 16 << 20));
    let dev = Device::new(
        sim.clone(),
        sim.clone(),
        Arc::new(ManualClock::new()),
        config(Family::R100),
    )
    .unwrap();

    for req in [
        Ioctl::CpStart,
        Ioctl::CpIdle,
        Ioctl::GetBuffers { count: 1 },
        Ioctl::State(vec![(r100::SE_VTX_FMT, 1)]),
    ] {
        assert_eq!(dev.ioctl(1, req).unwrap_err().errno, syscall::EINVAL);
    }
    assert_eq!(
        dev.ioctl(1, Ioctl::Copy { src: 0, dst: 0, words: 4 })
            .unwrap_err()
            .errno,
        syscall::ENOSYS
    );
}

#[test]
fn test_interrupt_advances_fences() {
    let sim = Arc::new(SimGpu::new(Family::R600, GART, 16 << 20));
    let dev = bring_up(&sim, Arc::new(ManualClock::new()), config(Family::R600));

    sim.set_auto_run(false);
    let (ring, seq) = fenced(
        dev.ioctl(1, Ioctl::State(vec![(r100::SE_VTX_FMT, 4)]))
            .unwrap(),
    );
    dev.service_interrupts();
    assert!(dev.fences().last_seq(ring) < seq);

    sim.run();
    assert!(dev.service_interrupts() >= 1);
    assert_eq!(dev.fences().last_seq(ring), seq);
    assert!(dev.stats().snapshot().interrupts >= 1);
}
