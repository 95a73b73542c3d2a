//! User/kernel memory copies
//!
//! Data crossing the user/kernel boundary moves through these routines,
//! which walk the user page table one page at a time via `resolve_user`
//! (so the U bit is enforced on every page) and fail -- without touching
//! kernel state -- on the first unmapped or kernel-only page.
//!
//! [`copy_out`] is COW-aware: writing through a shared page would corrupt
//! the other address space, so any destination page still carrying COW
//! bits is demoted first, exactly as a store from user mode would have
//! done. The kernel also maintains the A/D bits it would otherwise cheat
//! the hardware out of; munmap's dirty-page write-back depends on this.

use core::ptr;

use crate::error::KernelError;
use crate::mm::{
    frame::FrameAllocator, page_fault::demote_cow_page, user_space::UserAddressSpace, PteFlags,
    VirtAddr, PGSIZE,
};

/// Copy `src` into user memory at `dst_va`.
pub fn copy_out(
    space: &mut UserAddressSpace,
    dst_va: VirtAddr,
    src: &[u8],
    alloc: &FrameAllocator,
) -> Result<(), KernelError> {
    let mut copied = 0;
    let mut dst = dst_va.as_usize();
    while copied < src.len() {
        let va0 = VirtAddr::new(dst).page_base();

        // Writing through a still-shared page would be visible in the
        // sibling address space; demote it first.
        if let Some((_, flags)) = space.table().translate(va0) {
            if flags.intersects(PteFlags::COW_R | PteFlags::COW_W) {
                demote_cow_page(space, va0, alloc)?;
            }
        }

        let pa = space
            .table()
            .resolve_user(va0)
            .ok_or(KernelError::UnmappedMemory { addr: dst })?;
        let offset = dst - va0.as_usize();
        let n = (PGSIZE - offset).min(src.len() - copied);
        // SAFETY: `pa` is the frame backing a valid user mapping; the
        // write stays within one page.
        unsafe {
            ptr::copy_nonoverlapping(
                src[copied..].as_ptr(),
                pa.add(offset).as_mut_ptr::<u8>(),
                n,
            );
        }
        // The kernel performed the store on the process's behalf; keep the
        // accessed/dirty bits truthful.
        if let Some(entry) = space.table_mut().lookup_entry(va0) {
            let flags = entry.flags() | PteFlags::A | PteFlags::D;
            entry.set_flags(flags);
        }

        copied += n;
        dst = va0.as_usize() + PGSIZE;
    }
    Ok(())
}

/// Copy `dst.len()` bytes from user memory at `src_va` into `dst`.
pub fn copy_in(
    space: &UserAddressSpace,
    dst: &mut [u8],
    src_va: VirtAddr,
) -> Result<(), KernelError> {
    let mut copied = 0;
    let mut src = src_va.as_usize();
    while copied < dst.len() {
        let va0 = VirtAddr::new(src).page_base();
        let pa = space
            .table()
            .resolve_user(va0)
            .ok_or(KernelError::UnmappedMemory { addr: src })?;
        let offset = src - va0.as_usize();
        let n = (PGSIZE - offset).min(dst.len() - copied);
        // SAFETY: `pa` backs a valid user mapping; the read stays within
        // one page.
        unsafe {
            ptr::copy_nonoverlapping(
                pa.add(offset).as_ptr::<u8>(),
                dst[copied..].as_mut_ptr(),
                n,
            );
        }
        copied += n;
        src = va0.as_usize() + PGSIZE;
    }
    Ok(())
}

/// Copy a NUL-terminated string from user memory into `dst`.
///
/// At most `dst.len()` bytes are examined. Returns the string length (the
/// NUL is stored but not counted). If no NUL appears within range the copy
/// fails and `dst` contents are unspecified.
pub fn copy_in_str(
    space: &UserAddressSpace,
    dst: &mut [u8],
    src_va: VirtAddr,
) -> Result<usize, KernelError> {
    let max = dst.len();
    let mut copied = 0;
    let mut src = src_va.as_usize();
    while copied < max {
        let va0 = VirtAddr::new(src).page_base();
        let pa = space
            .table()
            .resolve_user(va0)
            .ok_or(KernelError::UnmappedMemory { addr: src })?;
        let offset = src - va0.as_usize();
        let n = (PGSIZE - offset).min(max - copied);
        // SAFETY: as in `copy_in`.
        let chunk = unsafe { core::slice::from_raw_parts(pa.add(offset).as_ptr::<u8>(), n) };
        for &byte in chunk {
            dst[copied] = byte;
            if byte == 0 {
                return Ok(copied);
            }
            copied += 1;
        }
        src = va0.as_usize() + PGSIZE;
    }
    Err(KernelError::InvalidArgument {
        name: "src_va",
        value: "string not NUL-terminated within bounds",
    })
}

/// Share kernel pages into a user address space copy-on-write.
///
/// Instead of copying `len` bytes, the frames backing
/// `[src_va, src_va + len)` in `src_space` are mapped into `dst_space` at
/// the page-aligned `dst_va` with the COW transition applied to both
/// sides, and the share counts bumped. The source address space is an
/// explicit argument; nothing here assumes which table the bytes live in.
/// Callers use this only where the destination region is known to be
/// freshly unmapped and sharable.
pub fn copy_out_cow(
    dst_space: &mut UserAddressSpace,
    dst_va: VirtAddr,
    src_space: &mut UserAddressSpace,
    src_va: VirtAddr,
    len: usize,
    alloc: &FrameAllocator,
) -> Result<(), KernelError> {
    if dst_va.page_offset() != 0 {
        return Err(KernelError::InvalidArgument {
            name: "dst_va",
            value: "destination must be page-aligned",
        });
    }
    let mut dst = dst_va.as_usize();
    let mut va = src_va.page_base().as_usize();
    while va < src_va.as_usize() + len {
        let (pa, flags) = {
            let entry = match src_space.table_mut().lookup_entry(VirtAddr::new(va)) {
                Some(e) => e,
                None => panic!("copy_out_cow: pte should exist at va {:#x}", va),
            };
            if !entry.is_valid() {
                panic!("copy_out_cow: page not present at va {:#x}", va);
            }
            let pa = entry.addr();
            let mut flags = entry.flags();
            if flags.intersects(PteFlags::R | PteFlags::COW_R) {
                flags.insert(PteFlags::COW_R);
            }
            if flags.intersects(PteFlags::W | PteFlags::COW_W) {
                flags.remove(PteFlags::W);
                flags.insert(PteFlags::COW_W);
            }
            entry.set_flags(flags);
            (pa, flags)
        };
        alloc.cow_share(pa);
        dst_space
            .table_mut()
            .map_pages(VirtAddr::new(dst), PGSIZE, pa, flags, alloc)?;
        va += PGSIZE;
        dst += PGSIZE;
    }
    Ok(())
}
