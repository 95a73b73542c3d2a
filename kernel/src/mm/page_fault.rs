//! Page fault handling
//!
//! The architecture trap handler decodes the RISC-V CSRs into a
//! [`PageFaultInfo`] and delegates here. The only fault class this core
//! resolves is copy-on-write: a write to a `U | COW_W` page, a read of a
//! `U | COW_R` page that lost R, or a fault on a former guard page that
//! still carries COW bits. Everything else propagates to the caller, which
//! kills the process.

use log::trace;

use crate::error::KernelError;
use crate::mm::{
    frame::FrameAllocator, user_space::UserAddressSpace, PteFlags, VirtAddr, PGSIZE,
};

/// Reason a page fault occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultKind {
    /// Load page fault (scause 13).
    Load,
    /// Store/AMO page fault (scause 15).
    Store,
    /// Instruction page fault (scause 12).
    InstructionFetch,
}

/// Information about a page fault collected by the trap handler.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    /// The virtual address that caused the fault (stval).
    pub addr: VirtAddr,
    /// Load, store or fetch.
    pub kind: PageFaultKind,
    /// Program counter at the time of the fault (sepc).
    pub pc: usize,
}

impl PageFaultInfo {
    /// Build a `PageFaultInfo` from the RISC-V trap CSRs, if the cause is
    /// a page fault at all.
    pub fn from_riscv(scause: usize, stval: usize, sepc: usize) -> Option<Self> {
        let kind = match scause {
            12 => PageFaultKind::InstructionFetch,
            13 => PageFaultKind::Load,
            15 => PageFaultKind::Store,
            _ => return None,
        };
        Some(Self {
            addr: VirtAddr::new(stval),
            kind,
            pc: sepc,
        })
    }
}

/// Resolve a user page fault against one address space.
///
/// `proc_size` is the process's recorded size; faults at or beyond it are
/// user errors, not COW work. On success the faulting access can be
/// retried.
pub fn handle_user_fault(
    space: &mut UserAddressSpace,
    proc_size: usize,
    info: PageFaultInfo,
    alloc: &FrameAllocator,
) -> Result<(), KernelError> {
    if info.addr.as_usize() >= proc_size {
        return Err(KernelError::InvalidAddress {
            addr: info.addr.as_usize(),
        });
    }
    demote_cow_page(space, info.addr, alloc)
}

/// Demote one COW page to private.
///
/// - share count >= 2: allocate a fresh frame, copy the contents, swap the
///   leaf over to it with R/W restored from `COW_R`/`COW_W`, and drop one
///   reference on the old frame;
/// - share count == 1: the caller is the last sharer -- restore R/W in
///   place, clear the COW bits, collapse the count to 0.
///
/// The access class is preserved: a page without U (the exec stack guard)
/// gets its permissions back but is NOT silently upgraded to
/// user-accessible. A zero share count on entry is an invariant violation
/// and panics; user actions cannot produce it.
pub(crate) fn demote_cow_page(
    space: &mut UserAddressSpace,
    va: VirtAddr,
    alloc: &FrameAllocator,
) -> Result<(), KernelError> {
    let va = va.page_base();

    let (pa, flags) = {
        let entry = match space.table_mut().lookup_entry(va) {
            Some(e) => e,
            None => {
                return Err(KernelError::UnmappedMemory {
                    addr: va.as_usize(),
                })
            }
        };
        if !entry.is_valid() {
            return Err(KernelError::UnmappedMemory {
                addr: va.as_usize(),
            });
        }
        (entry.addr(), entry.flags())
    };

    if !flags.intersects(PteFlags::COW_R | PteFlags::COW_W) {
        return Err(KernelError::PermissionDenied {
            operation: "fault on a page that is not copy-on-write",
        });
    }

    let mut restored = flags.difference(PteFlags::COW_R | PteFlags::COW_W);
    if flags.contains(PteFlags::COW_R) {
        restored.insert(PteFlags::R);
    }
    if flags.contains(PteFlags::COW_W) {
        restored.insert(PteFlags::W);
    }

    let count = alloc.cow_refcount(pa);
    match count {
        0 => panic!(
            "cow: refcount 0 at va {:#x} pa {:#x} (flags {:#x})",
            va.as_usize(),
            pa.as_usize(),
            flags.bits()
        ),
        1 => {
            // Last sharer: flip the existing leaf back to private.
            if let Some(entry) = space.table_mut().lookup_entry(va) {
                entry.set_flags(restored);
            }
            alloc.cow_clear(pa);
            crate::arch::flush_page(va.as_usize());
            trace!(
                "cow: demoted va {:#x} in place (pa {:#x})",
                va.as_usize(),
                pa.as_usize()
            );
            Ok(())
        }
        _ => {
            let frame = alloc.alloc_frame().ok_or(KernelError::ResourceExhausted {
                resource: "physical frames",
            })?;
            // SAFETY: both frames are identity-mapped; `frame` is fresh
            // and private to us.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    pa.as_ptr::<u8>(),
                    frame.as_mut_ptr::<u8>(),
                    PGSIZE,
                );
            }
            space.table_mut().unmap_pages(va, 1, false, alloc);
            space
                .table_mut()
                .map_pages(va, PGSIZE, frame, restored, alloc)?;
            alloc.cow_decref(pa);
            trace!(
                "cow: copied va {:#x} pa {:#x} -> {:#x} ({} sharers left)",
                va.as_usize(),
                pa.as_usize(),
                frame.as_usize(),
                count - 1
            );
            Ok(())
        }
    }
}
