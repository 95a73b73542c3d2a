//! Cobalt Kernel Core
//!
//! The memory-management and block-I/O core of a teaching-style RISC-V
//! (Sv39) kernel: a virtual-memory manager with copy-on-write fork, a
//! sharded buffer cache, and the mmap / file-descriptor glue binding user
//! processes to files and address-space regions.
//!
//! The crate is `no_std` on bare metal. On a hosted target it links std so
//! the unit tests run under the standard harness; "physical" frames in that
//! configuration come from a heap-backed arena and disk blocks from a RAM
//! disk. Boot, scheduling, the on-disk filesystem, and the crash log are
//! external collaborators reached through the traits in [`fs`] and
//! [`block`].

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod arch;
pub mod block;
pub mod error;
pub mod fs;
pub mod mm;
pub mod process;
pub mod sync;
pub mod syscall;

pub use error::KernelError;
pub use mm::{PhysAddr, VirtAddr, KERNBASE, MAXVA, PGSIZE};
