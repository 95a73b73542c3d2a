//! Block device layer
//!
//! [`BlockDevice`] is the seam between the buffer cache and whatever moves
//! bytes: the virtio driver on hardware, [`RamDisk`] on the host and in
//! early boot. Blocks are one page (4096 bytes) each; all filesystem
//! traffic above this layer goes through the [`buffer_cache`].

pub mod buffer_cache;
pub mod virtio_blk;

pub use buffer_cache::{BlockBuf, BufferCache, BCACHE_BUCKETS, NBUF};

use alloc::{sync::Arc, vec};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::error::KernelError;
use crate::sync::OnceLock;

/// Size of one disk block in bytes. Equal to the page size, so a buffer
/// payload is exactly one frame's worth of data.
pub const BSIZE: usize = 4096;

/// A device that moves whole blocks synchronously.
///
/// The calls block until the transfer is complete; the cache only invokes
/// them from sleepable context (holding a buffer's sleep-lock, never a
/// spin-lock).
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, block_no: u32, buf: &mut [u8]) -> Result<(), KernelError>;

    fn write_block(&self, block_no: u32, data: &[u8]) -> Result<(), KernelError>;

    fn block_count(&self) -> u32;
}

/// RAM-backed block device for tests and ramdisk boot.
///
/// Counts its transfers so tests can assert which accesses hit the cache
/// and which reached the "disk".
pub struct RamDisk {
    data: Mutex<alloc::vec::Vec<u8>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl RamDisk {
    pub fn new(blocks: u32) -> Self {
        Self {
            data: Mutex::new(vec![0u8; blocks as usize * BSIZE]),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_no: u32, buf: &mut [u8]) -> Result<(), KernelError> {
        let data = self.data.lock();
        let start = block_no as usize * BSIZE;
        if start + BSIZE > data.len() {
            return Err(KernelError::HardwareError {
                device: "ramdisk",
                code: block_no,
            });
        }
        buf[..BSIZE].copy_from_slice(&data[start..start + BSIZE]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_block(&self, block_no: u32, src: &[u8]) -> Result<(), KernelError> {
        let mut data = self.data.lock();
        let start = block_no as usize * BSIZE;
        if start + BSIZE > data.len() {
            return Err(KernelError::HardwareError {
                device: "ramdisk",
                code: block_no,
            });
        }
        data[start..start + BSIZE].copy_from_slice(&src[..BSIZE]);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn block_count(&self) -> u32 {
        (self.data.lock().len() / BSIZE) as u32
    }
}

// ---------------------------------------------------------------------------
// Global cache instance
// ---------------------------------------------------------------------------

/// The kernel's buffer cache, installed once the boot disk is probed.
static BCACHE: OnceLock<BufferCache> = OnceLock::new();

/// Install the global buffer cache over `device`. Called once at boot.
pub fn init(device: Arc<dyn BlockDevice>) {
    if BCACHE.set(BufferCache::new(device)).is_err() {
        panic!("block: buffer cache initialized twice");
    }
    log::info!(
        "block: buffer cache up ({} shards x {} buffers)",
        BCACHE_BUCKETS,
        NBUF
    );
}

/// The global buffer cache, if boot installed one.
pub fn cache() -> Option<&'static BufferCache> {
    BCACHE.get()
}
