//! Kernel error types
//!
//! One enum covers the recoverable error classes of the core: user errors
//! (bad descriptor, bad pointer, permission mismatch) and resource
//! exhaustion. Both surface to user space as a `-1` syscall return through
//! [`crate::syscall::ret`]. Invariant violations are not errors -- they are
//! panics carrying the subsystem and the offending addresses.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// A virtual address outside the range the caller may name.
    InvalidAddress {
        addr: usize,
    },
    /// A user virtual address with no valid, user-accessible mapping.
    UnmappedMemory {
        addr: usize,
    },
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    /// A fixed pool (frames, VMA slots, descriptors, ...) is empty.
    ResourceExhausted {
        resource: &'static str,
    },
    PermissionDenied {
        operation: &'static str,
    },
    BadFileDescriptor {
        fd: usize,
    },
    /// Path lookup failed.
    NotFound {
        resource: &'static str,
    },
    AlreadyExists {
        resource: &'static str,
    },
    /// Device-reported failure (virtio status byte, bounds).
    HardwareError {
        device: &'static str,
        code: u32,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::InvalidAddress { addr } => {
                write!(f, "invalid address {:#x}", addr)
            }
            KernelError::UnmappedMemory { addr } => {
                write!(f, "unmapped user memory at {:#x}", addr)
            }
            KernelError::InvalidArgument { name, value } => {
                write!(f, "invalid argument {}: {}", name, value)
            }
            KernelError::ResourceExhausted { resource } => {
                write!(f, "out of {}", resource)
            }
            KernelError::PermissionDenied { operation } => {
                write!(f, "permission denied: {}", operation)
            }
            KernelError::BadFileDescriptor { fd } => {
                write!(f, "bad file descriptor {}", fd)
            }
            KernelError::NotFound { resource } => {
                write!(f, "{} not found", resource)
            }
            KernelError::AlreadyExists { resource } => {
                write!(f, "{} already exists", resource)
            }
            KernelError::HardwareError { device, code } => {
                write!(f, "{} reported error {:#x}", device, code)
            }
        }
    }
}
