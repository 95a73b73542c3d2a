//! Process record
//!
//! The slice of a process the memory and file cores need: its address
//! space and size, its mapped regions, and its open files. The process
//! table, scheduler, and trap frames live outside this crate; everything
//! here is reached through an explicit `&mut Process` handed in by the
//! syscall and trap layers.

use alloc::sync::Arc;

use crate::error::KernelError;
use crate::fs::{FdTable, Inode};
use crate::mm::{
    frame::FrameAllocator,
    user_space::UserAddressSpace,
    vma::{self, Vma, NVMA},
};

pub struct Process {
    pub pid: u32,
    /// Recorded size of the user image in bytes; mmap may push it up.
    pub size: usize,
    pub space: UserAddressSpace,
    pub vmas: [Option<Vma>; NVMA],
    pub files: FdTable,
    pub cwd: Option<Arc<dyn Inode>>,
}

impl Process {
    pub fn new(pid: u32, alloc: &FrameAllocator) -> Result<Self, KernelError> {
        Ok(Self {
            pid,
            size: 0,
            space: UserAddressSpace::new(alloc)?,
            vmas: core::array::from_fn(|_| None),
            files: FdTable::new(),
            cwd: None,
        })
    }

    /// Copy-on-write fork: the child shares every user frame with this
    /// process, inherits the mapped regions (bumping each file reference)
    /// and the open files (sharing offsets).
    pub fn fork(&mut self, child_pid: u32, alloc: &FrameAllocator) -> Result<Process, KernelError> {
        let mut space = UserAddressSpace::new(alloc)?;
        if let Err(e) = self.space.clone_cow(&mut space, self.size, alloc) {
            // The child holds a prefix of the shared mappings; tearing it
            // down drops those share counts again.
            space.destroy(self.size, alloc);
            return Err(e);
        }
        Ok(Process {
            pid: child_pid,
            size: self.size,
            space,
            vmas: self.vmas.clone(),
            files: self.files.clone_for_fork(),
            cwd: self.cwd.clone(),
        })
    }

    /// Tear the process down: unmap every region (with its write-back
    /// semantics), drop the open files, and free the address space.
    pub fn exit(mut self, alloc: &FrameAllocator) {
        for i in 0..NVMA {
            let region = self.vmas[i].as_ref().map(|v| (v.start, v.len));
            if let Some((start, len)) = region {
                // A region can fail write-back only on a filesystem error;
                // the process is dying either way.
                let _ = vma::munmap(&mut self, alloc, start, len);
            }
        }
        self.files.close_all();
        let Process { space, size, .. } = self;
        space.destroy(size, alloc);
    }
}
