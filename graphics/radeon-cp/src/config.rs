// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Driver tunables

use std::str::FromStr;
use std::time::Duration;

use crate::ring::{MAX_RING_WORDS, MIN_RING_WORDS};
use crate::{Error, Result};

/// Longest busy-poll budget accepted for `usec_timeout`
pub const MAX_USEC_TIMEOUT: u32 = 100_000;

/// Chip generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// R100 through R500: one PM4 ring, scratch register fences
    R100,
    /// R600 and newer: PM4 ring plus async DMA ring, memory fences
    R600,
}

impl FromStr for Family {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "r100" | "r200" | "r300" | "rv100" | "rv200" => Ok(Family::R100),
            "r600" | "rv770" | "evergreen" => Ok(Family::R600),
            _ => Err(Error::InvalidArgument("unknown chip family")),
        }
    }
}

/// Driver configuration
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Chip generation
    pub family: Family,
    /// Busy-poll budget for ring, FIFO, idle and freelist waits
    pub usec_timeout: u32,
    /// Default ring size in words when `CpInit` does not give one
    pub ring_size_words: u32,
    /// DMA buffers on the freelist
    pub buffer_count: usize,
    /// Bytes per DMA buffer
    pub buffer_size: usize,
    /// Mirror read pointers and scratch registers into host memory
    pub use_writeback: bool,
    /// Hand out buffers round-robin instead of lowest index first
    pub rotate_freelist: bool,
    /// Fence inactivity window before a ring is declared locked up
    pub lockup_timeout: Duration,
    /// Fallback poll period for fence waits without interrupts
    pub fence_poll_interval: Duration,
    /// Cross-ring semaphore slots
    pub semaphore_slots: usize,
    /// Pending interrupt events kept before new ones are dropped
    pub irq_queue_depth: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            family: Family::R100,
            usec_timeout: MAX_USEC_TIMEOUT,
            ring_size_words: 64 * 1024,
            buffer_count: 32,
            buffer_size: 64 * 1024,
            use_writeback: true,
            rotate_freelist: false,
            lockup_timeout: Duration::from_secs(10),
            fence_poll_interval: Duration::from_millis(500),
            semaphore_slots: 64,
            irq_queue_depth: 256,
        }
    }
}

impl DriverConfig {
    /// Defaults overridden by `RADEON_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("RADEON_FAMILY") {
            match val.parse() {
                Ok(family) => config.family = family,
                Err(_) => log::warn!("radeon: ignoring unknown RADEON_FAMILY {:?}", val),
            }
        }

        if let Ok(val) = std::env::var("RADEON_USEC_TIMEOUT") {
            if let Ok(n) = val.parse() {
                config.usec_timeout = n;
            }
        }

        if let Ok(val) = std::env::var("RADEON_RING_SIZE") {
            if let Ok(n) = val.parse() {
                config.ring_size_words = n;
            }
        }

        if let Ok(val) = std::env::var("RADEON_BUFFERS") {
            if let Ok(n) = val.parse() {
                config.buffer_count = n;
            }
        }

        if let Ok(val) = std::env::var("RADEON_BUFFER_SIZE") {
            if let Ok(n) = val.parse() {
                config.buffer_size = n;
            }
        }

        if let Ok(val) = std::env::var("RADEON_NO_WB") {
            config.use_writeback = !(val == "1" || val.to_lowercase() == "true");
        }

        if let Ok(val) = std::env::var("RADEON_ROTATE_FREELIST") {
            config.rotate_freelist = val == "1" || val.to_lowercase() == "true";
        }

        if let Ok(val) = std::env::var("RADEON_LOCKUP_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                config.lockup_timeout = Duration::from_millis(n);
            }
        }

        if let Ok(val) = std::env::var("RADEON_FENCE_POLL_MS") {
            if let Ok(n) = val.parse() {
                config.fence_poll_interval = Duration::from_millis(n);
            }
        }

        config
    }

    /// Reject settings the hardware or the bookkeeping cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.usec_timeout == 0 || self.usec_timeout > MAX_USEC_TIMEOUT {
            return Err(Error::InvalidArgument("usec_timeout out of range"));
        }
        check_ring_size(self.ring_size_words)?;
        if self.buffer_count == 0 {
            return Err(Error::InvalidArgument("no DMA buffers configured"));
        }
        if self.buffer_size == 0 || self.buffer_size % 4096 != 0 {
            return Err(Error::InvalidArgument("buffer size must be whole pages"));
        }
        if self.lockup_timeout.is_zero() || self.fence_poll_interval.is_zero() {
            return Err(Error::InvalidArgument("zero fence timeout"));
        }
        if self.irq_queue_depth == 0 {
            return Err(Error::InvalidArgument("zero interrupt queue depth"));
        }
        Ok(())
    }
}

/// Ring sizes are powers of two within the hardware limits
pub fn check_ring_size(words: u32) -> Result<()> {
    if !words.is_power_of_two() || !(MIN_RING_WORDS..=MAX_RING_WORDS).contains(&words) {
        return Err(Error::InvalidArgument("ring size must be a power of two"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = DriverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.usec_timeout, 100_000);
        assert_eq!(config.lockup_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_validate_limits() {
        let mut config = DriverConfig::default();
        config.usec_timeout = 0;
        assert!(config.validate().is_err());
        config.usec_timeout = 100_001;
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.ring_size_words = 3000;
        assert!(config.validate().is_err());
        config.ring_size_words = 512;
        assert!(config.validate().is_err());
        config.ring_size_words = 1024;
        assert!(config.validate().is_ok());

        let mut config = DriverConfig::default();
        config.buffer_size = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_family_parse() {
        assert_eq!("R200".parse::<Family>(), Ok(Family::R100));
        assert_eq!("rv770".parse::<Family>(), Ok(Family::R600));
        assert!("nv40".parse::<Family>().is_err());
    }
}
