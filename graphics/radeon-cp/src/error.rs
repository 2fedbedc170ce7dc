// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Driver error types

use core::fmt;

/// Result type for command processor operations
pub type Result<T> = core::result::Result<T, Error>;

/// Command processor error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Ring, FIFO or engine did not drain within the polling budget
    Busy,
    /// Transient condition, the request may be resubmitted
    Again,
    /// No DMA buffer became free within the polling budget
    NoBuffers,
    /// Forward progress stopped on a ring while a fence was outstanding
    Lockup { ring: usize, seq: u64 },
    /// Ring was marked locked up and has not been reset since
    RingNotReady { ring: usize },
    /// Interruptible wait was interrupted, the caller may restart it
    Interrupted,
    /// Malformed request
    InvalidArgument(&'static str),
    /// Buffer is checked out by another process
    NotOwner { index: usize },
    /// Caller does not hold the hardware lock
    PermissionDenied,
    /// Command processor has not been initialized
    NotInitialized,
    /// Command processor is already initialized
    AlreadyInitialized,
    /// DMA aperture exhausted
    OutOfMemory,
    /// Operation not available on this chip generation
    NotSupported,
}

impl Error {
    /// Whether the ioctl layer may resubmit the request unchanged
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Busy | Error::Again | Error::Interrupted)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Busy => write!(f, "Device busy"),
            Error::Again => write!(f, "Try again"),
            Error::NoBuffers => write!(f, "No free DMA buffers"),
            Error::Lockup { ring, seq } => {
                write!(f, "GPU lockup on ring {} waiting for fence {:#x}", ring, seq)
            }
            Error::RingNotReady { ring } => write!(f, "Ring {} not ready", ring),
            Error::Interrupted => write!(f, "Interrupted"),
            Error::InvalidArgument(what) => write!(f, "Invalid argument: {}", what),
            Error::NotOwner { index } => write!(f, "Buffer {} owned by another process", index),
            Error::PermissionDenied => write!(f, "Hardware lock not held"),
            Error::NotInitialized => write!(f, "Command processor not initialized"),
            Error::AlreadyInitialized => write!(f, "Command processor already initialized"),
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::NotSupported => write!(f, "Not supported"),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for syscall::Error {
    fn from(err: Error) -> Self {
        let errno = match err {
            Error::Busy | Error::Again => syscall::EAGAIN,
            Error::NoBuffers => syscall::ENOMEM,
            Error::Lockup { .. } => syscall::EDEADLK,
            Error::RingNotReady { .. } => syscall::ENODEV,
            Error::Interrupted => syscall::EINTR,
            Error::InvalidArgument(_) | Error::NotOwner { .. } => syscall::EINVAL,
            Error::PermissionDenied => syscall::EPERM,
            Error::NotInitialized => syscall::EINVAL,
            Error::AlreadyInitialized => syscall::EBUSY,
            Error::OutOfMemory => syscall::ENOMEM,
            Error::NotSupported => syscall::ENOSYS,
        };
        syscall::Error::new(errno)
    }
}
