// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Radeon Command Processor
//!
//! Ring buffer management, DMA buffer aging and fence synchronization for
//! the command processor of R100 and R600 class Radeon GPUs.
//!
//! # Architecture
//!
//! - [`ring::RingBuffer`]: producer side of a GPU consumed ring
//! - [`freelist::Freelist`]: DMA buffers aged by the last dispatch counter
//! - [`fence::FenceDriver`]: 64-bit sequence fences with lockup detection
//! - [`semaphore::SemaphorePool`]: GPU side waits between rings
//! - [`asic::Asic`]: per generation packet encoding and register layout
//! - [`device::Device`]: hardware lock, CP lifecycle and engine reset
//! - [`ioctl`]: client requests mapped onto the above
//!
//! Hardware access goes through [`regs::RegisterFile`], [`dma::DmaAllocator`]
//! and [`clock::Clock`], so the whole stack runs against [`sim::SimGpu`].
//!
//! # Usage
//!
//! ```ignore
//! use radeon_cp::{CpInitParams, Device, DriverConfig, Ioctl};
//!
//! let config = DriverConfig::from_env();
//! let dev = Device::new(mmio, gart, Arc::new(MonotonicClock::new()), config)?;
//! dev.ioctl(pid, Ioctl::CpInit(CpInitParams::from_config(dev.config())))?;
//! dev.ioctl(pid, Ioctl::CpStart)?;
//! ```

pub mod asic;
pub mod clock;
pub mod config;
pub mod device;
pub mod dma;
pub mod error;
pub mod fence;
pub mod fifo;
pub mod freelist;
pub mod ioctl;
pub mod irq;
pub mod packet;
pub mod regs;
pub mod ring;
pub mod sarea;
pub mod semaphore;
pub mod sim;
pub mod stats;
pub mod submit;

// Re-exports
pub use clock::{Clock, MonotonicClock};
pub use config::{DriverConfig, Family};
pub use device::{CpInitParams, Device, HwGuard};
pub use dma::{DmaAllocator, DmaRegion, GartAperture};
pub use error::{Error, Result};
pub use fence::{Fence, FenceDriver, WaitStatus};
pub use freelist::Pid;
pub use ioctl::{Ioctl, Param, Reply};
pub use regs::RegisterFile;
