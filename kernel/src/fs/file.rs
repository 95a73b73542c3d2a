//! Open files and the per-process descriptor table
//!
//! An open [`File`] pairs an inode with the access mode it was opened
//! under and a shared offset. `dup` is an `Arc` clone -- duplicated
//! descriptors share the offset, which is what the published `dup`
//! contract requires -- and the last drop of the `Arc` is `fileclose`.
//!
//! Reads and writes move user data through a kernel bounce buffer and the
//! checked copy routines, so a bad user pointer fails cleanly before any
//! file state changes.

use alloc::{sync::Arc, vec};

use spin::Mutex;

use crate::error::KernelError;
use crate::fs::{Inode, Stat};
use crate::mm::{
    frame::FrameAllocator,
    user_copy::{copy_in, copy_out},
    user_space::UserAddressSpace,
    VirtAddr,
};

/// Open-file slots per process.
pub const NOFILE: usize = 16;

bitflags::bitflags! {
    /// `open` mode bits. Read is the absence of `WRONLY`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u32 {
        const WRONLY = 0x001;
        const RDWR = 0x002;
        const CREATE = 0x200;
        const TRUNC = 0x400;
    }
}

impl OpenMode {
    pub fn readable(&self) -> bool {
        !self.contains(Self::WRONLY)
    }

    pub fn writable(&self) -> bool {
        self.intersects(Self::WRONLY | Self::RDWR)
    }
}

/// One open file. Shared between descriptors (and across fork) via `Arc`.
pub struct File {
    inode: Arc<dyn Inode>,
    readable: bool,
    writable: bool,
    offset: Mutex<u64>,
}

impl File {
    pub fn new(inode: Arc<dyn Inode>, readable: bool, writable: bool) -> Arc<Self> {
        Arc::new(Self {
            inode,
            readable,
            writable,
            offset: Mutex::new(0),
        })
    }

    pub fn readable(&self) -> bool {
        self.readable
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn stat(&self) -> Stat {
        self.inode.stat()
    }

    /// Read up to `n` bytes at the shared offset into user memory at
    /// `dst_va`, advancing the offset by the amount read.
    pub fn read(
        &self,
        space: &mut UserAddressSpace,
        dst_va: VirtAddr,
        n: usize,
        alloc: &FrameAllocator,
    ) -> Result<usize, KernelError> {
        if !self.readable {
            return Err(KernelError::PermissionDenied {
                operation: "read from a write-only file",
            });
        }
        let mut off = self.offset.lock();
        let mut buf = vec![0u8; n];
        let read = self.inode.read_at(*off, &mut buf)?;
        copy_out(space, dst_va, &buf[..read], alloc)?;
        *off += read as u64;
        Ok(read)
    }

    /// Write `n` bytes from user memory at `src_va` at the shared offset.
    pub fn write(
        &self,
        space: &UserAddressSpace,
        src_va: VirtAddr,
        n: usize,
    ) -> Result<usize, KernelError> {
        if !self.writable {
            return Err(KernelError::PermissionDenied {
                operation: "write to a read-only file",
            });
        }
        let mut off = self.offset.lock();
        let mut buf = vec![0u8; n];
        copy_in(space, &mut buf, src_va)?;
        let written = self.inode.write_at(*off, &buf)?;
        *off += written as u64;
        Ok(written)
    }

    /// Positionless read, bypassing the shared offset. Used by mmap to
    /// populate a region from its backing file.
    pub fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<usize, KernelError> {
        self.inode.read_at(off, buf)
    }

    /// Positionless write, bypassing the shared offset. Used by munmap's
    /// dirty-page write-back, which runs with kernel rights regardless of
    /// the descriptor's mode.
    pub fn write_at(&self, off: u64, data: &[u8]) -> Result<usize, KernelError> {
        self.inode.write_at(off, data)
    }

    /// Copy the stat record out to user memory.
    pub fn fstat(
        &self,
        space: &mut UserAddressSpace,
        dst_va: VirtAddr,
        alloc: &FrameAllocator,
    ) -> Result<(), KernelError> {
        let st = self.inode.stat();
        // SAFETY: Stat is repr(C) plain data; its byte image is what the
        // published syscall contract hands to user space.
        let bytes = unsafe {
            core::slice::from_raw_parts(
                (&st as *const Stat).cast::<u8>(),
                core::mem::size_of::<Stat>(),
            )
        };
        copy_out(space, dst_va, bytes, alloc)
    }
}

/// Per-process descriptor table: a fixed array of shared open files.
pub struct FdTable {
    files: [Option<Arc<File>>; NOFILE],
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            files: core::array::from_fn(|_| None),
        }
    }

    /// Bind `file` to the lowest free descriptor.
    pub fn alloc(&mut self, file: Arc<File>) -> Result<usize, KernelError> {
        match self.files.iter().position(|slot| slot.is_none()) {
            Some(fd) => {
                self.files[fd] = Some(file);
                Ok(fd)
            }
            None => Err(KernelError::ResourceExhausted {
                resource: "file descriptors",
            }),
        }
    }

    /// Look up an open file; this is the `argfd` validation.
    pub fn get(&self, fd: usize) -> Result<Arc<File>, KernelError> {
        self.files
            .get(fd)
            .and_then(|slot| slot.clone())
            .ok_or(KernelError::BadFileDescriptor { fd })
    }

    /// Release a descriptor; the file closes when its last holder drops.
    pub fn close(&mut self, fd: usize) -> Result<(), KernelError> {
        match self.files.get_mut(fd).and_then(|slot| slot.take()) {
            Some(_) => Ok(()),
            None => Err(KernelError::BadFileDescriptor { fd }),
        }
    }

    /// Duplicate the whole table for fork; descriptors share offsets with
    /// the parent's.
    pub fn clone_for_fork(&self) -> Self {
        Self {
            files: self.files.clone(),
        }
    }

    pub fn close_all(&mut self) {
        for slot in self.files.iter_mut() {
            slot.take();
        }
    }

    #[cfg(test)]
    pub(crate) fn count_open(&self) -> usize {
        self.files.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::error::KernelError;
    use crate::fs::{Filesystem, Inode, InodeKind, RamFs};
    use crate::mm::frame::test_allocator;
    use crate::mm::user_copy::copy_in;
    use crate::mm::user_space::UserAddressSpace;
    use crate::mm::{VirtAddr, PGSIZE};

    fn open_test_file(contents: &[u8]) -> Arc<File> {
        let fs = RamFs::new();
        let ip = fs.create("f", InodeKind::File, 0, 0).unwrap();
        ip.write_at(0, contents).unwrap();
        File::new(ip, true, true)
    }

    #[test]
    fn fd_alloc_picks_lowest_free_slot() {
        let f = open_test_file(b"");
        let mut table = FdTable::new();
        assert_eq!(table.alloc(f.clone()).unwrap(), 0);
        assert_eq!(table.alloc(f.clone()).unwrap(), 1);
        assert_eq!(table.alloc(f.clone()).unwrap(), 2);

        table.close(1).unwrap();
        assert_eq!(table.alloc(f.clone()).unwrap(), 1);
    }

    #[test]
    fn table_fills_up_at_nofile() {
        let f = open_test_file(b"");
        let mut table = FdTable::new();
        for _ in 0..NOFILE {
            table.alloc(f.clone()).unwrap();
        }
        assert!(matches!(
            table.alloc(f.clone()),
            Err(KernelError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn close_rejects_bad_descriptors() {
        let mut table = FdTable::new();
        assert!(table.close(0).is_err());
        assert!(table.close(NOFILE + 3).is_err());
        assert!(table.get(0).is_err());
    }

    #[test]
    fn dup_shares_the_offset() {
        let alloc = test_allocator(16);
        let mut space = UserAddressSpace::new(&alloc).unwrap();
        space.grow(0, PGSIZE, &alloc).unwrap();

        let f = open_test_file(b"abcdef");
        let dup = f.clone(); // filedup

        let n = f.read(&mut space, VirtAddr::new(0), 3, &alloc).unwrap();
        assert_eq!(n, 3);
        let n = dup.read(&mut space, VirtAddr::new(8), 3, &alloc).unwrap();
        assert_eq!(n, 3);

        let mut bytes = [0u8; 3];
        copy_in(&space, &mut bytes, VirtAddr::new(8)).unwrap();
        assert_eq!(&bytes, b"def");
        space.destroy(PGSIZE, &alloc);
    }

    #[test]
    fn read_respects_open_mode() {
        let alloc = test_allocator(16);
        let mut space = UserAddressSpace::new(&alloc).unwrap();
        space.grow(0, PGSIZE, &alloc).unwrap();

        let fs = RamFs::new();
        let ip = fs.create("w", InodeKind::File, 0, 0).unwrap();
        let wronly = File::new(ip, false, true);
        assert!(wronly
            .read(&mut space, VirtAddr::new(0), 1, &alloc)
            .is_err());
        space.destroy(PGSIZE, &alloc);
    }

    #[test]
    fn fork_clone_keeps_files_shared() {
        let f = open_test_file(b"xyz");
        let mut table = FdTable::new();
        table.alloc(f.clone()).unwrap();

        let child = table.clone_for_fork();
        assert_eq!(child.count_open(), 1);
        // Parent slot and child slot are the same File object.
        assert!(Arc::ptr_eq(&table.get(0).unwrap(), &child.get(0).unwrap()));
    }
}
