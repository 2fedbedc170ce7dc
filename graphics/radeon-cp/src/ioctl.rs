// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Client request surface
//!
//! Requests that touch the rings take the hardware lock for their duration.
//! Fence waits and counter queries do not, so a client blocked on a fence
//! never holds up submissions.

use syscall::error::{Error as SysError, Result as SysResult};

use crate::device::{CpInitParams, Device};
use crate::fence::{FenceLocation, WaitStatus};
use crate::freelist::Pid;
use crate::submit::{Blit, BufferGrant, Clear, Draw, Indirect, Swap};
use crate::{Error, Result};

/// Values readable through [`Ioctl::GetParam`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    LastFrame,
    LastDispatch,
    LastClear,
    /// Ring size in words
    RingSize,
    NumRings,
    /// 1 when read pointers and scratch registers are written back to memory
    Writeback,
    /// Bus address of the fence value of a ring, 0 for register fences
    FenceAddr(usize),
    /// Writeback page offset of the fence value of a ring
    FenceOffset(usize),
    /// Last completed fence sequence of a ring
    LastSeq(usize),
    /// Last emitted fence sequence of a ring
    LastEmitted(usize),
}

/// Client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ioctl {
    CpInit(CpInitParams),
    CpCleanup,
    CpStart,
    CpStop { idle: bool },
    CpReset,
    CpIdle,
    EngineReset,
    GetBuffers { count: usize },
    Discard { index: usize },
    Indirect(Indirect),
    Clear(Clear),
    Vertex(Draw),
    Blit(Blit),
    State(Vec<(u32, u32)>),
    Swap(Swap),
    /// DMA ring copy between bus addresses
    Copy { src: u64, dst: u64, words: u32 },
    GetParam(Param),
    FenceWait { ring: usize, seq: u64, interruptible: bool },
    WaitIdle,
}

/// Answer to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Done,
    Buffers(Vec<BufferGrant>),
    /// Submission fenced with `seq` on `ring`
    Fence { ring: usize, seq: u64 },
    Value(u64),
    Wait(WaitStatus),
}

impl Device {
    /// Execute one request for `pid`
    pub fn ioctl(&self, pid: Pid, req: Ioctl) -> SysResult<Reply> {
        let name = req.name();
        self.dispatch(pid, req).map_err(|err| {
            if err.is_transient() {
                log::debug!("radeon: {} for pid {}: {}", name, pid, err);
            } else if matches!(err, Error::Lockup { .. } | Error::RingNotReady { .. }) {
                log::warn!("radeon: {} for pid {}: {}", name, pid, err);
            } else {
                log::error!("radeon: {} for pid {}: {}", name, pid, err);
            }
            SysError::from(err)
        })
    }

    fn dispatch(&self, pid: Pid, req: Ioctl) -> Result<Reply> {
        let fenced = |fence: crate::fence::Fence| Reply::Fence {
            ring: fence.ring(),
            seq: fence.seq(),
        };

        match req {
            Ioctl::GetParam(param) => self.param(param).map(Reply::Value),
            Ioctl::FenceWait {
                ring,
                seq,
                interruptible,
            } => self.wait_fence(ring, seq, interruptible).map(Reply::Wait),

            Ioctl::CpInit(params) => self.lock(pid).cp_init(params).map(|()| Reply::Done),
            Ioctl::CpCleanup => self.lock(pid).cp_cleanup().map(|()| Reply::Done),
            Ioctl::CpStart => self.lock(pid).cp_start().map(|()| Reply::Done),
            Ioctl::CpStop { idle } => self.lock(pid).cp_stop(idle).map(|()| Reply::Done),
            Ioctl::CpReset => self.lock(pid).cp_reset().map(|()| Reply::Done),
            Ioctl::CpIdle => self.lock(pid).cp_idle().map(|()| Reply::Done),
            Ioctl::EngineReset => self.lock(pid).engine_reset().map(|()| Reply::Done),
            Ioctl::WaitIdle => self.lock(pid).wait_for_idle().map(|()| Reply::Done),

            Ioctl::GetBuffers { count } => self.lock(pid).get_buffers(count).map(Reply::Buffers),
            Ioctl::Discard { index } => self.lock(pid).discard(index).map(fenced),
            Ioctl::Indirect(ib) => self.lock(pid).indirect(&ib).map(fenced),
            Ioctl::Clear(clear) => self.lock(pid).clear(&clear).map(fenced),
            Ioctl::Vertex(draw) => self.lock(pid).draw(&draw).map(fenced),
            Ioctl::Blit(blit) => self.lock(pid).blit(&blit).map(fenced),
            Ioctl::State(writes) => self.lock(pid).emit_state(&writes).map(fenced),
            Ioctl::Swap(swap) => self.lock(pid).swap(&swap).map(fenced),
            Ioctl::Copy { src, dst, words } => self.lock(pid).copy(src, dst, words).map(fenced),
        }
    }

    fn param(&self, param: Param) -> Result<u64> {
        let ring_check = |ring: usize| {
            if ring < self.asic().num_rings() {
                Ok(ring)
            } else {
                Err(Error::InvalidArgument("no such ring"))
            }
        };

        Ok(match param {
            Param::LastFrame => u64::from(self.last_frame()),
            Param::LastDispatch => u64::from(self.last_dispatch()),
            Param::LastClear => u64::from(self.last_clear()),
            Param::RingSize => {
                let hw = self.lock(0);
                let words = hw.ring(0)?.size();
                u64::from(words)
            }
            Param::NumRings => self.asic().num_rings() as u64,
            Param::Writeback => u64::from(self.lock(0).uses_writeback()?),
            Param::FenceAddr(ring) => {
                let ring = ring_check(ring)?;
                match self.fences().location(ring) {
                    Some(location) => location.gpu_addr().unwrap_or(0),
                    None => return Err(Error::NotInitialized),
                }
            }
            Param::FenceOffset(ring) => {
                let ring = ring_check(ring)?;
                match self.fences().location(ring) {
                    Some(FenceLocation::Memory { index, .. }) => (index * 4) as u64,
                    Some(FenceLocation::Scratch { mirror: Some((_, index)), .. }) => {
                        (index * 4) as u64
                    }
                    Some(FenceLocation::Scratch { mirror: None, .. }) => {
                        return Err(Error::NotSupported)
                    }
                    None => return Err(Error::NotInitialized),
                }
            }
            Param::LastSeq(ring) => self.fences().last_seq(ring_check(ring)?),
            Param::LastEmitted(ring) => self.fences().last_emitted(ring_check(ring)?),
        })
    }
}

impl Ioctl {
    fn name(&self) -> &'static str {
        match self {
            Ioctl::CpInit(_) => "CP_INIT",
            Ioctl::CpCleanup => "CP_CLEANUP",
            Ioctl::CpStart => "CP_START",
            Ioctl::CpStop { .. } => "CP_STOP",
            Ioctl::CpReset => "CP_RESET",
            Ioctl::CpIdle => "CP_IDLE",
            Ioctl::EngineReset => "RESET",
            Ioctl::GetBuffers { .. } => "GET_BUFFERS",
            Ioctl::Discard { .. } => "DISCARD",
            Ioctl::Indirect(_) => "INDIRECT",
            Ioctl::Clear(_) => "CLEAR",
            Ioctl::Vertex(_) => "VERTEX",
            Ioctl::Blit(_) => "BLIT",
            Ioctl::State(_) => "STATE",
            Ioctl::Swap(_) => "SWAP",
            Ioctl::Copy { .. } => "COPY",
            Ioctl::GetParam(_) => "GETPARAM",
            Ioctl::FenceWait { .. } => "FENCE_WAIT",
            Ioctl::WaitIdle => "WAIT_IDLE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverConfig, Family};
    use crate::device::{WB_FENCE, WB_SCRATCH};
    use crate::sarea::SCRATCH_FENCE;
    use crate::sim::{ManualClock, SimGpu};
    use std::sync::Arc;

    fn device(family: Family) -> Device {
        let sim = Arc::new(SimGpu::new(family, 0x4000_0000, 16 << 20));
        let config = DriverConfig {
            family,
            ring_size_words: 1024,
            buffer_count: 2,
            buffer_size: 4096,
            usec_timeout: 100,
            ..DriverConfig::default()
        };
        Device::new(sim.clone(), sim, Arc::new(ManualClock::new()), config).unwrap()
    }

    fn init(dev: &Device) {
        let params = CpInitParams::from_config(dev.config());
        assert_eq!(dev.ioctl(1, Ioctl::CpInit(params)), Ok(Reply::Done));
        assert_eq!(dev.ioctl(1, Ioctl::CpStart), Ok(Reply::Done));
    }

    #[test]
    fn test_errno_for_uninitialized() {
        let dev = device(Family::R100);
        let err = dev.ioctl(1, Ioctl::CpStart).unwrap_err();
        assert_eq!(err.errno, syscall::EINVAL);
        let err = dev.ioctl(1, Ioctl::GetBuffers { count: 1 }).unwrap_err();
        assert_eq!(err.errno, syscall::EINVAL);
    }

    #[test]
    fn test_submit_and_wait() {
        let dev = device(Family::R100);
        init(&dev);

        let reply = dev
            .ioctl(1, Ioctl::State(vec![(crate::regs::r100::SE_VTX_FMT, 3)]))
            .unwrap();
        let Reply::Fence { ring, seq } = reply else {
            panic!("unexpected reply {:?}", reply);
        };
        assert_eq!((ring, seq), (0, 1));
        assert_eq!(
            dev.ioctl(
                1,
                Ioctl::FenceWait {
                    ring,
                    seq,
                    interruptible: true
                }
            ),
            Ok(Reply::Wait(WaitStatus::Signaled))
        );
        assert_eq!(dev.ioctl(1, Ioctl::GetParam(Param::LastSeq(0))), Ok(Reply::Value(1)));
        assert_eq!(
            dev.ioctl(1, Ioctl::GetParam(Param::LastEmitted(0))),
            Ok(Reply::Value(1))
        );
    }

    #[test]
    fn test_params() {
        let dev = device(Family::R100);
        init(&dev);
        assert_eq!(dev.ioctl(1, Ioctl::GetParam(Param::RingSize)), Ok(Reply::Value(1024)));
        assert_eq!(dev.ioctl(1, Ioctl::GetParam(Param::NumRings)), Ok(Reply::Value(1)));
        assert_eq!(dev.ioctl(1, Ioctl::GetParam(Param::Writeback)), Ok(Reply::Value(1)));
        assert_eq!(
            dev.ioctl(1, Ioctl::GetParam(Param::FenceOffset(0))),
            Ok(Reply::Value(((WB_SCRATCH + SCRATCH_FENCE as usize) * 4) as u64))
        );
        assert_eq!(
            dev.ioctl(1, Ioctl::GetParam(Param::FenceOffset(1)))
                .unwrap_err()
                .errno,
            syscall::EINVAL
        );

        let dev = device(Family::R600);
        init(&dev);
        assert_eq!(
            dev.ioctl(1, Ioctl::GetParam(Param::FenceOffset(1))),
            Ok(Reply::Value(((WB_FENCE + 1) * 4) as u64))
        );
    }

    #[test]
    fn test_writeback_param_follows_init() {
        let dev = device(Family::R100);
        assert_eq!(
            dev.ioctl(1, Ioctl::GetParam(Param::Writeback))
                .unwrap_err()
                .errno,
            syscall::EINVAL
        );

        let params = CpInitParams {
            writeback: false,
            ..CpInitParams::from_config(dev.config())
        };
        assert_eq!(dev.ioctl(1, Ioctl::CpInit(params)), Ok(Reply::Done));
        assert_eq!(dev.ioctl(1, Ioctl::GetParam(Param::Writeback)), Ok(Reply::Value(0)));
        assert_eq!(
            dev.ioctl(1, Ioctl::GetParam(Param::FenceOffset(0)))
                .unwrap_err()
                .errno,
            syscall::ENOSYS
        );
    }

    #[test]
    fn test_buffer_exhaustion_is_enomem() {
        let dev = device(Family::R100);
        init(&dev);
        let Ok(Reply::Buffers(grants)) = dev.ioctl(4, Ioctl::GetBuffers { count: 2 }) else {
            panic!("no buffers");
        };
        assert_eq!(grants.len(), 2);
        let err = dev.ioctl(4, Ioctl::GetBuffers { count: 1 }).unwrap_err();
        assert_eq!(err.errno, syscall::ENOMEM);

        assert!(matches!(
            dev.ioctl(4, Ioctl::Discard { index: grants[1].index }),
            Ok(Reply::Fence { .. })
        ));
        assert!(matches!(
            dev.ioctl(4, Ioctl::GetBuffers { count: 1 }),
            Ok(Reply::Buffers(_))
        ));
    }
}
