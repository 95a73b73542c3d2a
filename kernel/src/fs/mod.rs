//! Filesystem interfaces
//!
//! The on-disk inode and directory machinery is an external collaborator;
//! the core consumes it through the traits here. [`Inode`] is positionless
//! byte-level access plus metadata, [`Filesystem`] is path resolution and
//! namespace mutation, and [`LogOps`] is the crash-safety layer whose
//! `begin_op`/`end_op` bracket every filesystem mutation (held as the RAII
//! [`Op`] guard).
//!
//! [`RamFs`] is a flat-namespace in-memory implementation backing the unit
//! tests and early boot, in the spirit of a ramfs: real enough to exercise
//! every consumer, with no block layer underneath.

pub mod file;

pub use file::{FdTable, File, OpenMode, NOFILE};

use alloc::{collections::BTreeMap, string::String, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use spin::Mutex;

use crate::error::KernelError;

/// Maximum path length accepted by the syscall facade.
pub const MAXPATH: usize = 128;

/// Inode type as reported by `fstat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum InodeKind {
    Dir = 1,
    File = 2,
    Device = 3,
}

/// The record `fstat` copies out to user space.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Stat {
    pub dev: u32,
    pub ino: u32,
    pub kind: InodeKind,
    pub nlink: u16,
    pub size: u64,
}

/// Byte-level access to one inode.
pub trait Inode: Send + Sync {
    /// Read up to `buf.len()` bytes at byte offset `off`; returns the
    /// number read (short at end of file).
    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<usize, KernelError>;

    /// Write `data` at byte offset `off`, extending the file as needed.
    fn write_at(&self, off: u64, data: &[u8]) -> Result<usize, KernelError>;

    /// Discard the file contents.
    fn trunc(&self) -> Result<(), KernelError>;

    fn stat(&self) -> Stat;
}

/// Path-level operations of the external filesystem.
pub trait Filesystem: Send + Sync {
    fn namei(&self, path: &str) -> Result<Arc<dyn Inode>, KernelError>;

    fn create(
        &self,
        path: &str,
        kind: InodeKind,
        major: u16,
        minor: u16,
    ) -> Result<Arc<dyn Inode>, KernelError>;

    /// Make `new` a link to the same inode as `old`. Directories cannot be
    /// linked.
    fn link(&self, old: &str, new: &str) -> Result<(), KernelError>;

    /// Remove the directory entry `path`. Non-empty directories, `.` and
    /// `..` cannot be unlinked.
    fn unlink(&self, path: &str) -> Result<(), KernelError>;
}

/// The external crash log. Every filesystem mutation runs inside one op.
pub trait LogOps: Send + Sync {
    fn begin_op(&self);
    fn end_op(&self);
}

/// RAII bracket around a log operation.
pub struct Op<'a> {
    log: &'a dyn LogOps,
}

impl<'a> Op<'a> {
    pub fn new(log: &'a dyn LogOps) -> Self {
        log.begin_op();
        Self { log }
    }
}

impl Drop for Op<'_> {
    fn drop(&mut self) {
        self.log.end_op();
    }
}

/// A log layer that journals nothing; used in tests and before the real
/// log is mounted.
pub struct NullLog;

impl LogOps for NullLog {
    fn begin_op(&self) {}
    fn end_op(&self) {}
}

// ---------------------------------------------------------------------------
// RamFs
// ---------------------------------------------------------------------------

/// An in-memory inode.
pub struct RamInode {
    ino: u32,
    kind: InodeKind,
    #[allow(dead_code)]
    major: u16,
    #[allow(dead_code)]
    minor: u16,
    nlink: AtomicU16,
    data: Mutex<Vec<u8>>,
}

impl Inode for RamInode {
    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<usize, KernelError> {
        let data = self.data.lock();
        let off = off as usize;
        if off >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - off);
        buf[..n].copy_from_slice(&data[off..off + n]);
        Ok(n)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<usize, KernelError> {
        let mut data = self.data.lock();
        let off = off as usize;
        if data.len() < off + src.len() {
            data.resize(off + src.len(), 0);
        }
        data[off..off + src.len()].copy_from_slice(src);
        Ok(src.len())
    }

    fn trunc(&self) -> Result<(), KernelError> {
        self.data.lock().clear();
        Ok(())
    }

    fn stat(&self) -> Stat {
        Stat {
            dev: 0,
            ino: self.ino,
            kind: self.kind,
            nlink: self.nlink.load(Ordering::Relaxed),
            size: self.data.lock().len() as u64,
        }
    }
}

/// Flat-namespace in-memory filesystem.
pub struct RamFs {
    nodes: Mutex<BTreeMap<String, Arc<RamInode>>>,
    next_ino: AtomicU32,
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl RamFs {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(BTreeMap::new()),
            next_ino: AtomicU32::new(1),
        }
    }

    fn new_inode(&self, kind: InodeKind, major: u16, minor: u16) -> Arc<RamInode> {
        Arc::new(RamInode {
            ino: self.next_ino.fetch_add(1, Ordering::Relaxed),
            kind,
            major,
            minor,
            nlink: AtomicU16::new(1),
            data: Mutex::new(Vec::new()),
        })
    }
}

impl Filesystem for RamFs {
    fn namei(&self, path: &str) -> Result<Arc<dyn Inode>, KernelError> {
        self.nodes
            .lock()
            .get(path)
            .cloned()
            .map(|n| n as Arc<dyn Inode>)
            .ok_or(KernelError::NotFound { resource: "path" })
    }

    fn create(
        &self,
        path: &str,
        kind: InodeKind,
        major: u16,
        minor: u16,
    ) -> Result<Arc<dyn Inode>, KernelError> {
        let mut nodes = self.nodes.lock();
        if let Some(existing) = nodes.get(path) {
            // Re-creating an existing regular file is an open(CREATE) hit.
            if kind == InodeKind::File && existing.kind == InodeKind::File {
                return Ok(existing.clone());
            }
            return Err(KernelError::AlreadyExists { resource: "path" });
        }
        let node = self.new_inode(kind, major, minor);
        nodes.insert(String::from(path), node.clone());
        Ok(node)
    }

    fn link(&self, old: &str, new: &str) -> Result<(), KernelError> {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .get(old)
            .cloned()
            .ok_or(KernelError::NotFound { resource: "path" })?;
        if node.kind == InodeKind::Dir {
            return Err(KernelError::PermissionDenied {
                operation: "link a directory",
            });
        }
        if nodes.contains_key(new) {
            return Err(KernelError::AlreadyExists { resource: "path" });
        }
        node.nlink.fetch_add(1, Ordering::Relaxed);
        nodes.insert(String::from(new), node);
        Ok(())
    }

    fn unlink(&self, path: &str) -> Result<(), KernelError> {
        if path == "." || path == ".." {
            return Err(KernelError::PermissionDenied {
                operation: "unlink . or ..",
            });
        }
        let mut nodes = self.nodes.lock();
        let node = nodes
            .remove(path)
            .ok_or(KernelError::NotFound { resource: "path" })?;
        node.nlink.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }
}
