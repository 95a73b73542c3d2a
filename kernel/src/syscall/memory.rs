//! Memory system calls
//!
//! `mmap` and `munmap` over the per-process region table. Raw flag words
//! from user space are checked here; the region logic itself lives in
//! [`crate::mm::vma`].

use crate::error::KernelError;
use crate::fs::LogOps;
use crate::mm::frame::FrameAllocator;
use crate::mm::vma::{self, MapFlags, ProtFlags};
use crate::process::Process;

/// mmap(addr, length, prot, flags, fd, offset) -> start address
pub fn sys_mmap(
    p: &mut Process,
    alloc: &FrameAllocator,
    addr: usize,
    length: usize,
    prot: u32,
    flags: u32,
    fd: usize,
    offset: u64,
) -> Result<usize, KernelError> {
    let prot = ProtFlags::from_bits(prot).ok_or(KernelError::InvalidArgument {
        name: "prot",
        value: "unknown protection bits",
    })?;
    let flags = MapFlags::from_bits(flags).ok_or(KernelError::InvalidArgument {
        name: "flags",
        value: "unknown mapping bits",
    })?;
    let file = p.files.get(fd)?;
    vma::mmap(p, alloc, addr, length, prot, flags, file, offset)
}

/// munmap(addr, length)
///
/// The dirty-page write-back is a filesystem mutation, so the whole call
/// runs under a log operation.
pub fn sys_munmap(
    p: &mut Process,
    alloc: &FrameAllocator,
    log: &dyn LogOps,
    addr: usize,
    length: usize,
) -> Result<(), KernelError> {
    let _op = crate::fs::Op::new(log);
    vma::munmap(p, alloc, addr, length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;
    use crate::fs::{File, Filesystem, Inode, InodeKind, NullLog, OpenMode, RamFs};
    use crate::mm::frame::test_allocator;
    use crate::mm::vma::{MapFlags, ProtFlags};
    use crate::process::Process;
    use crate::mm::user_copy::{copy_in, copy_out};
    use crate::mm::{PGSIZE, VirtAddr};
    use crate::syscall::file::{sys_open, sys_read};
    use crate::syscall::ret;

    /// End-to-end write-back: mmap shared, write "hello", munmap, re-read
    /// through a fresh descriptor.
    #[test]
    fn mmap_write_munmap_read_back() {
        let alloc = test_allocator(64);
        let mut p = Process::new(1, &alloc).unwrap();
        // A one-page process image; the mapping will land above it.
        p.size = p.space.grow(0, PGSIZE, &alloc).unwrap();
        let fs = RamFs::new();
        let log = NullLog;

        // Seed an 8 KiB file.
        let ip = fs.create("shared", InodeKind::File, 0, 0).unwrap();
        ip.write_at(0, &[0u8; 2 * PGSIZE]).unwrap();

        let fd = sys_open(&mut p, &fs, &log, "shared", OpenMode::RDWR).unwrap();
        let start = sys_mmap(
            &mut p,
            &alloc,
            0,
            2 * PGSIZE,
            (ProtFlags::READ | ProtFlags::WRITE).bits(),
            MapFlags::SHARED.bits(),
            fd,
            0,
        )
        .unwrap();

        copy_out(&mut p.space, VirtAddr::new(start), b"hello", &alloc).unwrap();
        sys_munmap(&mut p, &alloc, &log, start, 2 * PGSIZE).unwrap();

        let fd2 = sys_open(&mut p, &fs, &log, "shared", OpenMode::RDWR).unwrap();
        let dst = 256; // inside the process image
        assert_eq!(sys_read(&mut p, &alloc, fd2, dst, 5).unwrap(), 5);
        let mut buf = [0u8; 5];
        copy_in(&p.space, &mut buf, VirtAddr::new(dst)).unwrap();
        assert_eq!(&buf, b"hello");
        p.exit(&alloc);
    }

    #[test]
    fn mmap_rejects_bad_descriptor_and_bad_bits() {
        let alloc = test_allocator(32);
        let mut p = Process::new(1, &alloc).unwrap();

        assert_eq!(
            ret(sys_mmap(
                &mut p,
                &alloc,
                0,
                PGSIZE,
                ProtFlags::READ.bits(),
                MapFlags::PRIVATE.bits(),
                3,
                0
            )),
            -1
        );

        let fs = RamFs::new();
        let ip = fs.create("f", InodeKind::File, 0, 0).unwrap();
        let f = File::new(ip, true, true);
        let fd = p.files.alloc(f).unwrap();
        assert_eq!(
            ret(sys_mmap(&mut p, &alloc, 0, PGSIZE, 0xff, 0x1, fd, 0)),
            -1
        );
        p.exit(&alloc);
    }

    #[test]
    fn munmap_of_unmapped_range_fails_cleanly() {
        let alloc = test_allocator(32);
        let mut p = Process::new(1, &alloc).unwrap();
        let log = NullLog;
        let err = sys_munmap(&mut p, &alloc, &log, 0x10_0000, PGSIZE).unwrap_err();
        assert!(matches!(err, KernelError::NotFound { .. }));
        p.exit(&alloc);
    }
}
