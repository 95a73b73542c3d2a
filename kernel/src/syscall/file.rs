//! File system calls
//!
//! `dup`, `read`, `write`, `close` and `fstat` touch only the descriptor
//! table and the open file. The path-level calls (`open`, `link`,
//! `unlink`, `mkdir`, `mknod`, `chdir`) delegate to the external
//! [`Filesystem`] with every mutation bracketed by a log [`Op`]; their
//! post-conditions are the callees' contracts.

use crate::error::KernelError;
use crate::fs::{File, Filesystem, Inode, InodeKind, LogOps, Op, OpenMode};
use crate::mm::{frame::FrameAllocator, VirtAddr};
use crate::process::Process;

/// dup(fd): bind the same open file to the lowest free descriptor. The
/// two descriptors share one offset.
pub fn sys_dup(p: &mut Process, fd: usize) -> Result<usize, KernelError> {
    let file = p.files.get(fd)?;
    p.files.alloc(file)
}

/// read(fd, buf, n)
pub fn sys_read(
    p: &mut Process,
    alloc: &FrameAllocator,
    fd: usize,
    buf: usize,
    n: usize,
) -> Result<usize, KernelError> {
    let file = p.files.get(fd)?;
    file.read(&mut p.space, VirtAddr::new(buf), n, alloc)
}

/// write(fd, buf, n)
pub fn sys_write(
    p: &mut Process,
    fd: usize,
    buf: usize,
    n: usize,
) -> Result<usize, KernelError> {
    let file = p.files.get(fd)?;
    file.write(&p.space, VirtAddr::new(buf), n)
}

/// close(fd)
pub fn sys_close(p: &mut Process, fd: usize) -> Result<(), KernelError> {
    p.files.close(fd)
}

/// fstat(fd, addr): copy the stat record to user memory.
pub fn sys_fstat(
    p: &mut Process,
    alloc: &FrameAllocator,
    fd: usize,
    addr: usize,
) -> Result<(), KernelError> {
    let file = p.files.get(fd)?;
    file.fstat(&mut p.space, VirtAddr::new(addr), alloc)
}

/// open(path, omode)
pub fn sys_open(
    p: &mut Process,
    fs: &dyn Filesystem,
    log: &dyn LogOps,
    path: &str,
    mode: OpenMode,
) -> Result<usize, KernelError> {
    let _op = Op::new(log);

    let inode = if mode.contains(OpenMode::CREATE) {
        fs.create(path, InodeKind::File, 0, 0)?
    } else {
        fs.namei(path)?
    };

    // Directories open read-only.
    if inode.stat().kind == InodeKind::Dir && mode.writable() {
        return Err(KernelError::PermissionDenied {
            operation: "open a directory for writing",
        });
    }
    if mode.contains(OpenMode::TRUNC) && inode.stat().kind == InodeKind::File {
        inode.trunc()?;
    }

    let file = File::new(inode, mode.readable(), mode.writable());
    p.files.alloc(file)
}

/// link(old, new)
pub fn sys_link(
    fs: &dyn Filesystem,
    log: &dyn LogOps,
    old: &str,
    new: &str,
) -> Result<(), KernelError> {
    let _op = Op::new(log);
    fs.link(old, new)
}

/// unlink(path)
pub fn sys_unlink(fs: &dyn Filesystem, log: &dyn LogOps, path: &str) -> Result<(), KernelError> {
    let _op = Op::new(log);
    fs.unlink(path)
}

/// mkdir(path)
pub fn sys_mkdir(fs: &dyn Filesystem, log: &dyn LogOps, path: &str) -> Result<(), KernelError> {
    let _op = Op::new(log);
    fs.create(path, InodeKind::Dir, 0, 0).map(|_| ())
}

/// mknod(path, major, minor)
pub fn sys_mknod(
    fs: &dyn Filesystem,
    log: &dyn LogOps,
    path: &str,
    major: u16,
    minor: u16,
) -> Result<(), KernelError> {
    let _op = Op::new(log);
    fs.create(path, InodeKind::Device, major, minor).map(|_| ())
}

/// chdir(path): requires a directory.
pub fn sys_chdir(
    p: &mut Process,
    fs: &dyn Filesystem,
    log: &dyn LogOps,
    path: &str,
) -> Result<(), KernelError> {
    let _op = Op::new(log);
    let inode = fs.namei(path)?;
    if inode.stat().kind != InodeKind::Dir {
        return Err(KernelError::InvalidArgument {
            name: "path",
            value: "not a directory",
        });
    }
    p.cwd = Some(inode);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{Filesystem, Inode, InodeKind, NullLog, OpenMode, RamFs};
    use crate::mm::frame::{test_allocator, FrameAllocator};
    use crate::mm::user_copy::{copy_in, copy_out};
    use crate::mm::VirtAddr;
    use crate::process::Process;
    use crate::mm::PGSIZE;
    use crate::syscall::{ret, ret0};

    fn setup(alloc: &FrameAllocator) -> (Process, RamFs, NullLog) {
        let mut p = Process::new(1, alloc).unwrap();
        p.size = p.space.grow(0, PGSIZE, alloc).unwrap();
        (p, RamFs::new(), NullLog)
    }

    #[test]
    fn open_write_read_roundtrip() {
        let alloc = test_allocator(32);
        let (mut p, fs, log) = setup(&alloc);

        let fd = sys_open(
            &mut p,
            &fs,
            &log,
            "data",
            OpenMode::CREATE | OpenMode::RDWR,
        )
        .unwrap();
        assert_eq!(fd, 0);

        copy_out(&mut p.space, VirtAddr::new(64), b"payload", &alloc).unwrap();
        assert_eq!(sys_write(&mut p, fd, 64, 7).unwrap(), 7);

        // Fresh descriptor, fresh offset.
        let fd2 = sys_open(&mut p, &fs, &log, "data", OpenMode::RDWR).unwrap();
        assert_eq!(sys_read(&mut p, &alloc, fd2, 128, 7).unwrap(), 7);
        let mut buf = [0u8; 7];
        copy_in(&p.space, &mut buf, VirtAddr::new(128)).unwrap();
        assert_eq!(&buf, b"payload");
        p.exit(&alloc);
    }

    #[test]
    fn read_with_bad_pointer_fails_without_moving_offset() {
        let alloc = test_allocator(32);
        let (mut p, fs, log) = setup(&alloc);
        let fd = sys_open(
            &mut p,
            &fs,
            &log,
            "f",
            OpenMode::CREATE | OpenMode::RDWR,
        )
        .unwrap();
        copy_out(&mut p.space, VirtAddr::new(0), b"abc", &alloc).unwrap();
        sys_write(&mut p, fd, 0, 3).unwrap();

        let fd2 = sys_open(&mut p, &fs, &log, "f", OpenMode::RDWR).unwrap();
        // Destination far outside the process image.
        assert_eq!(ret(sys_read(&mut p, &alloc, fd2, 0x40_0000, 3)), -1);
        p.exit(&alloc);
    }

    #[test]
    fn dup_and_close_manage_slots() {
        let alloc = test_allocator(32);
        let (mut p, fs, log) = setup(&alloc);
        let fd = sys_open(
            &mut p,
            &fs,
            &log,
            "f",
            OpenMode::CREATE | OpenMode::RDWR,
        )
        .unwrap();
        let dup = sys_dup(&mut p, fd).unwrap();
        assert_eq!(dup, fd + 1);

        sys_close(&mut p, fd).unwrap();
        assert!(p.files.get(fd).is_err());
        assert!(p.files.get(dup).is_ok());
        assert_eq!(ret0(sys_close(&mut p, fd)), -1);
        p.exit(&alloc);
    }

    #[test]
    fn fstat_reports_through_user_memory() {
        let alloc = test_allocator(32);
        let (mut p, fs, log) = setup(&alloc);
        let fd = sys_open(
            &mut p,
            &fs,
            &log,
            "f",
            OpenMode::CREATE | OpenMode::RDWR,
        )
        .unwrap();
        copy_out(&mut p.space, VirtAddr::new(0), b"12345", &alloc).unwrap();
        sys_write(&mut p, fd, 0, 5).unwrap();

        sys_fstat(&mut p, &alloc, fd, 512).unwrap();
        let mut raw = [0u8; core::mem::size_of::<crate::fs::Stat>()];
        copy_in(&p.space, &mut raw, VirtAddr::new(512)).unwrap();
        // size is the trailing u64 of the repr(C) record.
        let size = u64::from_ne_bytes(raw[raw.len() - 8..].try_into().unwrap());
        assert_eq!(size, 5);
        p.exit(&alloc);
    }

    #[test]
    fn chdir_demands_a_directory() {
        let alloc = test_allocator(32);
        let (mut p, fs, log) = setup(&alloc);
        sys_mkdir(&fs, &log, "dir").unwrap();
        sys_open(
            &mut p,
            &fs,
            &log,
            "file",
            OpenMode::CREATE | OpenMode::RDWR,
        )
        .unwrap();

        assert!(sys_chdir(&mut p, &fs, &log, "dir").is_ok());
        assert!(sys_chdir(&mut p, &fs, &log, "file").is_err());
        assert!(sys_chdir(&mut p, &fs, &log, "missing").is_err());
        p.exit(&alloc);
    }

    #[test]
    fn mknod_records_device_kind() {
        let alloc = test_allocator(32);
        let (_p, fs, log) = setup(&alloc);
        sys_mknod(&fs, &log, "console", 1, 0).unwrap();
        assert_eq!(fs.namei("console").unwrap().stat().kind, InodeKind::Device);
    }
}
