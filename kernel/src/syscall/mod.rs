//! System call facade
//!
//! Thin shells around the core: each function validates its arguments
//! (the descriptor lookup is the `argfd` of old), calls into the VM /
//! file / region layers, and reports the result in the C convention the
//! published syscall table promises -- a non-negative value on success,
//! `-1` on any user error or exhausted resource. Register decoding and
//! dispatch live with the trap handler outside this crate.

pub mod file;
pub mod memory;

use log::debug;

use crate::error::KernelError;

/// Collapse a kernel result into the syscall return convention.
pub fn ret(result: Result<usize, KernelError>) -> isize {
    match result {
        Ok(v) => v as isize,
        Err(e) => {
            debug!("syscall failed: {}", e);
            -1
        }
    }
}

/// As [`ret`], for syscalls whose success value is 0.
pub fn ret0(result: Result<(), KernelError>) -> isize {
    ret(result.map(|()| 0))
}
