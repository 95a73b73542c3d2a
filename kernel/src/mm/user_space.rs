//! User address-space operations
//!
//! Create, grow, shrink, copy and tear down the user half of an address
//! space. Sizes are byte counts as the process sees them; the operations
//! round to pages internally, mirroring the process-size bookkeeping the
//! process layer does.
//!
//! The default fork path is [`UserAddressSpace::clone_cow`]: parent and
//! child end up mapping the same frames with `COW_R`/`COW_W` set and `W`
//! cleared, and the frame allocator's reference table records the sharing.
//! [`UserAddressSpace::clone_eager`] is the baseline deep copy, kept as a
//! fallback.

use core::ptr;

use crate::error::KernelError;
use crate::mm::{
    frame::FrameAllocator, page_round_up, page_table::PageTable, PteFlags, VirtAddr, PGSIZE,
};

/// The user portion of one process's address space.
pub struct UserAddressSpace {
    table: PageTable,
}

impl UserAddressSpace {
    /// Allocate an empty user page table.
    pub fn new(alloc: &FrameAllocator) -> Result<Self, KernelError> {
        Ok(Self {
            table: PageTable::new(alloc)?,
        })
    }

    pub fn table(&self) -> &PageTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut PageTable {
        &mut self.table
    }

    /// Install the first process image: one RWX user page at VA 0.
    ///
    /// The image must fit in a single page; a larger one is a boot-time
    /// programming error.
    pub fn load_initcode(
        &mut self,
        src: &[u8],
        alloc: &FrameAllocator,
    ) -> Result<(), KernelError> {
        if src.len() >= PGSIZE {
            panic!("load_initcode: image of {} bytes exceeds a page", src.len());
        }
        let frame = alloc.alloc_frame().ok_or(KernelError::ResourceExhausted {
            resource: "physical frames",
        })?;
        self.table.map_pages(
            VirtAddr::new(0),
            PGSIZE,
            frame,
            PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U,
            alloc,
        )?;
        // SAFETY: the frame was just allocated for this mapping and is
        // reachable through the identity map.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), frame.as_mut_ptr::<u8>(), src.len());
        }
        Ok(())
    }

    /// Grow the space from `old_sz` to `new_sz` bytes with zeroed RWX user
    /// pages. On failure every page mapped by this call is rewound and the
    /// space is back at `old_sz`.
    pub fn grow(
        &mut self,
        old_sz: usize,
        new_sz: usize,
        alloc: &FrameAllocator,
    ) -> Result<usize, KernelError> {
        if new_sz < old_sz {
            return Ok(old_sz);
        }
        let mut a = page_round_up(old_sz);
        while a < new_sz {
            let frame = match alloc.alloc_frame() {
                Some(f) => f,
                None => {
                    self.shrink(a, old_sz, alloc);
                    return Err(KernelError::ResourceExhausted {
                        resource: "physical frames",
                    });
                }
            };
            if let Err(e) = self.table.map_pages(
                VirtAddr::new(a),
                PGSIZE,
                frame,
                PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U,
                alloc,
            ) {
                alloc.free_frame(frame);
                self.shrink(a, old_sz, alloc);
                return Err(e);
            }
            a += PGSIZE;
        }
        Ok(new_sz)
    }

    /// Shrink from `old_sz` to `new_sz`, unmapping and freeing the pages in
    /// between. `new_sz >= old_sz` is a no-op returning `old_sz`.
    pub fn shrink(&mut self, old_sz: usize, new_sz: usize, alloc: &FrameAllocator) -> usize {
        if new_sz >= old_sz {
            return old_sz;
        }
        if page_round_up(new_sz) < page_round_up(old_sz) {
            let npages = (page_round_up(old_sz) - page_round_up(new_sz)) / PGSIZE;
            self.table
                .unmap_pages(VirtAddr::new(page_round_up(new_sz)), npages, true, alloc);
        }
        new_sz
    }

    /// Strip the U bit from the page holding `va`; used by exec to turn the
    /// page below the user stack into a guard.
    pub fn clear_user(&mut self, va: VirtAddr) {
        match self.table.lookup_entry(va) {
            Some(entry) => {
                let flags = entry.flags().difference(PteFlags::U);
                entry.set_flags(flags);
                crate::arch::flush_page(va.as_usize());
            }
            None => panic!("clear_user: va {:#x} not mapped", va.as_usize()),
        }
    }

    /// Copy-on-write duplication of the first `sz` bytes into `child`.
    ///
    /// Every valid user page is mirrored into the child at the same
    /// physical address: pages readable (or already `COW_R`) gain `COW_R`,
    /// writable (or already `COW_W`) pages lose `W` and gain `COW_W`, in
    /// both tables, and the frame's share count is bumped. Non-U pages
    /// (the stack guard) are mirrored with their flags untouched.
    ///
    /// On allocation failure the child table holds a prefix of the
    /// mappings; the caller tears it down with [`Self::destroy`], which
    /// drops the share counts taken so far.
    pub fn clone_cow(
        &mut self,
        child: &mut UserAddressSpace,
        sz: usize,
        alloc: &FrameAllocator,
    ) -> Result<(), KernelError> {
        let mut va = 0;
        while va < sz {
            let entry = match self.table.lookup_entry(VirtAddr::new(va)) {
                Some(e) => e,
                None => panic!("clone_cow: pte should exist at va {:#x}", va),
            };
            if !entry.is_valid() {
                panic!("clone_cow: page not present at va {:#x}", va);
            }
            let pa = entry.addr();
            let mut flags = entry.flags();
            if flags.contains(PteFlags::U) {
                if flags.intersects(PteFlags::R | PteFlags::COW_R) {
                    flags.insert(PteFlags::COW_R);
                }
                if flags.intersects(PteFlags::W | PteFlags::COW_W) {
                    flags.remove(PteFlags::W);
                    flags.insert(PteFlags::COW_W);
                }
                entry.set_flags(flags);
                crate::arch::flush_page(va);
            }
            alloc.cow_share(pa);
            if let Err(e) = child
                .table
                .map_pages(VirtAddr::new(va), PGSIZE, pa, flags, alloc)
            {
                // Undo the share taken for the page that never landed; the
                // caller destroys the child, which drops the rest.
                alloc.cow_decref(pa);
                if alloc.cow_refcount(pa) == 1 {
                    alloc.cow_clear(pa);
                }
                return Err(e);
            }
            va += PGSIZE;
        }
        Ok(())
    }

    /// Eager duplication of the first `sz` bytes into `child`: every frame
    /// is copied. Baseline fallback for [`Self::clone_cow`].
    pub fn clone_eager(
        &mut self,
        child: &mut UserAddressSpace,
        sz: usize,
        alloc: &FrameAllocator,
    ) -> Result<(), KernelError> {
        let mut va = 0;
        while va < sz {
            let entry = match self.table.lookup_entry(VirtAddr::new(va)) {
                Some(e) => e,
                None => panic!("clone_eager: pte should exist at va {:#x}", va),
            };
            if !entry.is_valid() {
                panic!("clone_eager: page not present at va {:#x}", va);
            }
            let pa = entry.addr();
            let flags = entry.flags();
            let frame = match alloc.alloc_frame() {
                Some(f) => f,
                None => {
                    Self::rewind_eager(child, va, alloc);
                    return Err(KernelError::ResourceExhausted {
                        resource: "physical frames",
                    });
                }
            };
            // SAFETY: both frames are identity-mapped; `frame` is fresh
            // and private.
            unsafe {
                ptr::copy_nonoverlapping(pa.as_ptr::<u8>(), frame.as_mut_ptr::<u8>(), PGSIZE);
            }
            if let Err(e) = child
                .table
                .map_pages(VirtAddr::new(va), PGSIZE, frame, flags, alloc)
            {
                alloc.free_frame(frame);
                Self::rewind_eager(child, va, alloc);
                return Err(e);
            }
            va += PGSIZE;
        }
        Ok(())
    }

    fn rewind_eager(child: &mut UserAddressSpace, copied_up_to: usize, alloc: &FrameAllocator) {
        if copied_up_to > 0 {
            child
                .table
                .unmap_pages(VirtAddr::new(0), copied_up_to / PGSIZE, true, alloc);
        }
    }

    /// Free every user leaf below `sz` (tolerating holes left by munmap),
    /// then the table pages themselves. Consumes the space.
    pub fn destroy(mut self, sz: usize, alloc: &FrameAllocator) {
        let mut va = 0;
        while va < page_round_up(sz) {
            if let Some(entry) = self.table.lookup_entry(VirtAddr::new(va)) {
                if entry.is_valid() {
                    let pa = entry.addr();
                    entry.clear();
                    alloc.free_frame(pa);
                }
            }
            va += PGSIZE;
        }
        self.table.free_walk(alloc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;
    use crate::mm::frame::{test_allocator, FrameAllocator};
    use crate::mm::{PteFlags, VirtAddr, PGSIZE};

    fn space(alloc: &FrameAllocator) -> UserAddressSpace {
        UserAddressSpace::new(alloc).unwrap()
    }

    #[test]
    fn initcode_lands_at_va0() {
        let alloc = test_allocator(8);
        let mut s = space(&alloc);
        s.load_initcode(&[0x13, 0x05, 0x00, 0x00], &alloc).unwrap();

        let (pa, flags) = s.table().translate(VirtAddr::new(0)).unwrap();
        assert!(flags.contains(
            PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U
        ));
        let bytes = unsafe { core::slice::from_raw_parts(pa.as_ptr::<u8>(), 4) };
        assert_eq!(bytes, &[0x13, 0x05, 0x00, 0x00]);
        s.destroy(PGSIZE, &alloc);
    }

    #[test]
    fn grow_then_shrink_unmaps_range() {
        let alloc = test_allocator(16);
        let mut s = space(&alloc);

        let sz = s.grow(0, 3 * PGSIZE, &alloc).unwrap();
        assert_eq!(sz, 3 * PGSIZE);
        assert!(s.table().translate(VirtAddr::new(2 * PGSIZE)).is_some());

        let sz = s.shrink(sz, 0, &alloc);
        assert_eq!(sz, 0);
        assert!(s.table().translate(VirtAddr::new(0)).is_none());
        assert!(s.table().translate(VirtAddr::new(2 * PGSIZE)).is_none());
        s.destroy(0, &alloc);
    }

    #[test]
    fn shrink_to_larger_size_is_a_noop() {
        let alloc = test_allocator(8);
        let mut s = space(&alloc);
        let sz = s.grow(0, PGSIZE, &alloc).unwrap();
        assert_eq!(s.shrink(sz, 2 * PGSIZE, &alloc), sz);
        assert!(s.table().translate(VirtAddr::new(0)).is_some());
        s.destroy(sz, &alloc);
    }

    #[test]
    fn grow_rewinds_on_exhaustion() {
        // 4 frames: root + 2 interior tables leaves 1 frame of headroom,
        // so a two-page grow must fail and rewind.
        let alloc = test_allocator(4);
        let mut s = space(&alloc);
        let err = s.grow(0, 2 * PGSIZE, &alloc).unwrap_err();
        assert!(matches!(err, KernelError::ResourceExhausted { .. }));
        assert!(s.table().translate(VirtAddr::new(0)).is_none());
        s.destroy(0, &alloc);
    }

    #[test]
    fn clear_user_strips_u() {
        let alloc = test_allocator(8);
        let mut s = space(&alloc);
        s.grow(0, PGSIZE, &alloc).unwrap();

        s.clear_user(VirtAddr::new(0));
        let (_, flags) = s.table().translate(VirtAddr::new(0)).unwrap();
        assert!(!flags.contains(PteFlags::U));
        assert!(s.table().resolve_user(VirtAddr::new(0)).is_none());
        s.destroy(PGSIZE, &alloc);
    }

    #[test]
    fn clone_cow_shares_frames_and_marks_both_sides() {
        let alloc = test_allocator(16);
        let mut parent = space(&alloc);
        parent.grow(0, PGSIZE, &alloc).unwrap();
        let (pa, _) = parent.table().translate(VirtAddr::new(0)).unwrap();

        let mut child = space(&alloc);
        parent.clone_cow(&mut child, PGSIZE, &alloc).unwrap();

        let (ppa, pflags) = parent.table().translate(VirtAddr::new(0)).unwrap();
        let (cpa, cflags) = child.table().translate(VirtAddr::new(0)).unwrap();
        assert_eq!(ppa, pa);
        assert_eq!(cpa, pa);
        for flags in [pflags, cflags] {
            assert!(flags.contains(PteFlags::COW_R | PteFlags::COW_W | PteFlags::U));
            assert!(!flags.contains(PteFlags::W));
        }
        assert_eq!(alloc.cow_refcount(pa), 2);

        child.destroy(PGSIZE, &alloc);
        assert_eq!(alloc.cow_refcount(pa), 1);
        parent.destroy(PGSIZE, &alloc);
        assert_eq!(alloc.cow_refcount(pa), 0);
    }

    #[test]
    fn clone_cow_keeps_guard_pages_inaccessible() {
        let alloc = test_allocator(16);
        let mut parent = space(&alloc);
        parent.grow(0, 2 * PGSIZE, &alloc).unwrap();
        parent.clear_user(VirtAddr::new(0));

        let mut child = space(&alloc);
        parent.clone_cow(&mut child, 2 * PGSIZE, &alloc).unwrap();

        let (_, cflags) = child.table().translate(VirtAddr::new(0)).unwrap();
        assert!(!cflags.contains(PteFlags::U));
        // Guard pages keep their original permissions unchanged.
        assert!(!cflags.intersects(PteFlags::COW_R | PteFlags::COW_W));

        child.destroy(2 * PGSIZE, &alloc);
        parent.destroy(2 * PGSIZE, &alloc);
    }

    #[test]
    fn clone_eager_copies_are_independent() {
        let alloc = test_allocator(16);
        let mut parent = space(&alloc);
        parent.grow(0, PGSIZE, &alloc).unwrap();
        let (ppa, _) = parent.table().translate(VirtAddr::new(0)).unwrap();
        unsafe { *ppa.as_mut_ptr::<u8>() = 0x5a };

        let mut child = space(&alloc);
        parent.clone_eager(&mut child, PGSIZE, &alloc).unwrap();
        let (cpa, _) = child.table().translate(VirtAddr::new(0)).unwrap();
        assert_ne!(ppa, cpa);
        assert_eq!(unsafe { *cpa.as_ptr::<u8>() }, 0x5a);

        unsafe { *cpa.as_mut_ptr::<u8>() = 0x77 };
        assert_eq!(unsafe { *ppa.as_ptr::<u8>() }, 0x5a);

        child.destroy(PGSIZE, &alloc);
        parent.destroy(PGSIZE, &alloc);
    }
}
