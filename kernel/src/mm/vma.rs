//! Memory-mapped regions
//!
//! Each process owns a fixed array of [`Vma`] records describing its
//! file-backed mappings; fork duplicates the array, bumping each record's
//! file reference. There is no global region pool and no global lock --
//! a region belongs to exactly one process.
//!
//! Mapping is eager: `mmap` allocates zeroed frames for the whole region,
//! reads the file contents in at map time, and installs user-accessible
//! leaf PTEs. `munmap` writes dirty pages of `MAP_SHARED` regions back to
//! the file before tearing the pages down. Regions are tracked at page
//! granularity; lengths round up to a page boundary on entry.

use alloc::{sync::Arc, vec};
use log::debug;

use crate::error::KernelError;
use crate::fs::File;
use crate::mm::{
    frame::FrameAllocator, page_round_up, PhysAddr, PteFlags, VirtAddr, KERNBASE, PGSIZE,
};
use crate::process::Process;

/// Memory-mapped-region slots per process.
pub const NVMA: usize = 16;

bitflags::bitflags! {
    /// `mmap` protection bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtFlags: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

bitflags::bitflags! {
    /// `mmap` sharing bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const SHARED = 0x01;
        const PRIVATE = 0x02;
    }
}

impl ProtFlags {
    /// Translate to PTE permissions. The U bit is the region installer's
    /// business, not the protection's.
    fn to_pte(self) -> PteFlags {
        let mut pte = PteFlags::empty();
        if self.contains(Self::READ) {
            pte.insert(PteFlags::R);
        }
        if self.contains(Self::WRITE) {
            pte.insert(PteFlags::W);
        }
        if self.contains(Self::EXEC) {
            pte.insert(PteFlags::X);
        }
        pte
    }
}

/// One mapped region.
#[derive(Clone)]
pub struct Vma {
    pub start: usize,
    pub len: usize,
    pub prot: ProtFlags,
    pub flags: MapFlags,
    pub file: Arc<File>,
    pub offset: u64,
}

/// Map `length` bytes of `file` starting at `offset` into the process.
///
/// The address search begins at the page above `hint` and takes the first
/// run of unmapped pages below `KERNBASE`, restarting above any occupied
/// page it meets. Writable `MAP_SHARED` over a file not opened for writing
/// is rejected before anything is allocated, so the failure path releases
/// only the file reference. Returns the chosen start address.
pub fn mmap(
    p: &mut Process,
    alloc: &FrameAllocator,
    hint: usize,
    length: usize,
    prot: ProtFlags,
    flags: MapFlags,
    file: Arc<File>,
    offset: u64,
) -> Result<usize, KernelError> {
    if length == 0 {
        return Err(KernelError::InvalidArgument {
            name: "length",
            value: "zero-length mapping",
        });
    }
    if flags.contains(MapFlags::SHARED) && prot.contains(ProtFlags::WRITE) && !file.writable() {
        // Dropping `file` here is the fileclose of the error path.
        return Err(KernelError::PermissionDenied {
            operation: "writable MAP_SHARED of a read-only file",
        });
    }

    let len = page_round_up(length);
    let start = find_region(p, page_round_up(hint), len).ok_or(KernelError::ResourceExhausted {
        resource: "user address space",
    })?;

    // Region mappings are user-accessible: the process asked for them.
    let perm = prot.to_pte() | PteFlags::U;
    map_populated(p, alloc, start, len, perm, &file, offset)?;

    let slot = match p.vmas.iter().position(|s| s.is_none()) {
        Some(i) => i,
        None => {
            p.space.table_mut().unmap_pages(
                VirtAddr::new(start),
                len / PGSIZE,
                true,
                alloc,
            );
            return Err(KernelError::ResourceExhausted {
                resource: "memory-mapped region slots",
            });
        }
    };
    p.vmas[slot] = Some(Vma {
        start,
        len,
        prot,
        flags,
        file,
        offset,
    });
    if p.size < start + len {
        p.size = start + len;
    }
    debug!("mmap: [{:#x}, {:#x}) in slot {}", start, start + len, slot);
    Ok(start)
}

/// First-fit search for `len` bytes of unmapped address space.
fn find_region(p: &Process, hint: usize, len: usize) -> Option<usize> {
    let mut start = hint;
    'search: while start + len < KERNBASE {
        let mut va = start;
        while va < start + len {
            if p.space.table().translate(VirtAddr::new(va)).is_some() {
                // Occupied; restart just above it.
                start = va + PGSIZE;
                continue 'search;
            }
            va += PGSIZE;
        }
        return Some(start);
    }
    None
}

/// Allocate, map and populate the region's pages. On any failure the pages
/// mapped so far are unmapped and freed.
fn map_populated(
    p: &mut Process,
    alloc: &FrameAllocator,
    start: usize,
    len: usize,
    perm: PteFlags,
    file: &Arc<File>,
    offset: u64,
) -> Result<(), KernelError> {
    let mut page_buf = vec![0u8; PGSIZE];
    let mut mapped = 0;
    while mapped < len {
        let result = (|| {
            let frame = alloc.alloc_frame().ok_or(KernelError::ResourceExhausted {
                resource: "physical frames",
            })?;
            if let Err(e) = p.space.table_mut().map_pages(
                VirtAddr::new(start + mapped),
                PGSIZE,
                frame,
                perm,
                alloc,
            ) {
                alloc.free_frame(frame);
                return Err(e);
            }
            // Pull the file contents in at map time; anything past end of
            // file stays zero.
            let n = file.read_at(offset + mapped as u64, &mut page_buf)?;
            if n > 0 {
                // SAFETY: `frame` was just mapped for this region and is
                // identity-mapped for the kernel.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        page_buf.as_ptr(),
                        frame.as_mut_ptr::<u8>(),
                        n,
                    );
                }
            }
            Ok(())
        })();
        if let Err(e) = result {
            if mapped > 0 {
                p.space
                    .table_mut()
                    .unmap_pages(VirtAddr::new(start), mapped / PGSIZE, true, alloc);
            }
            return Err(e);
        }
        mapped += PGSIZE;
    }
    Ok(())
}

/// Unmap `[addr, addr + length)` from one region.
///
/// The range must lie inside a single region and touch one of its ends:
/// punching a hole in the middle is rejected. `MAP_SHARED` pages whose
/// dirty bit is set are written back to the file at
/// `offset + (page - region start)` first. Unmapping the whole region
/// clears the slot that owned it and drops its file reference.
pub fn munmap(
    p: &mut Process,
    alloc: &FrameAllocator,
    addr: usize,
    length: usize,
) -> Result<(), KernelError> {
    if addr % PGSIZE != 0 {
        return Err(KernelError::InvalidArgument {
            name: "addr",
            value: "not page-aligned",
        });
    }
    if length == 0 {
        return Err(KernelError::InvalidArgument {
            name: "length",
            value: "zero-length unmap",
        });
    }
    let len = page_round_up(length);

    let mut found = None;
    for i in 0..NVMA {
        if let Some(v) = &p.vmas[i] {
            if v.start <= addr && addr + len <= v.start + v.len {
                found = Some(i);
                break;
            }
        }
    }
    let idx = found.ok_or(KernelError::NotFound {
        resource: "memory-mapped region",
    })?;

    // Borrow the slot for the checks and the write-back.
    {
        let v = match &p.vmas[idx] {
            Some(v) => v,
            None => unreachable!(),
        };
        if v.start < addr && addr + len < v.start + v.len {
            return Err(KernelError::InvalidArgument {
                name: "addr",
                value: "unmap would punch a hole in the region",
            });
        }
        if v.flags.contains(MapFlags::SHARED) {
            write_back_dirty(p, v, addr, len)?;
        }
    }

    // Adjust the record in place; whole-region unmap clears exactly the
    // slot the search bound, releasing its file reference.
    let (vstart, vlen) = match &p.vmas[idx] {
        Some(v) => (v.start, v.len),
        None => unreachable!(),
    };
    if vstart == addr && vlen == len {
        p.vmas[idx] = None;
    } else if let Some(v) = p.vmas[idx].as_mut() {
        if v.start == addr {
            v.start += len;
            v.len -= len;
        } else {
            v.len -= len;
        }
    }

    p.space
        .table_mut()
        .unmap_pages(VirtAddr::new(addr), len / PGSIZE, true, alloc);
    debug!("munmap: [{:#x}, {:#x})", addr, addr + len);
    Ok(())
}

/// Flush dirty pages of a shared region back to the backing file.
fn write_back_dirty(p: &Process, v: &Vma, addr: usize, len: usize) -> Result<(), KernelError> {
    let mut va = addr;
    while va < addr + len {
        if let Some((pa, flags)) = p.space.table().translate(VirtAddr::new(va)) {
            if flags.contains(PteFlags::D) {
                let bytes = page_bytes(pa);
                v.file
                    .write_at(v.offset + (va - v.start) as u64, bytes)?;
            }
        }
        va += PGSIZE;
    }
    Ok(())
}

fn page_bytes<'a>(pa: PhysAddr) -> &'a [u8] {
    // SAFETY: every frame the VM hands out is identity-mapped and
    // PGSIZE long.
    unsafe { core::slice::from_raw_parts(pa.as_ptr::<u8>(), PGSIZE) }
}
