//! Virtio-blk device driver (MMIO transport)
//!
//! Driver for the legacy virtio-mmio block device QEMU's `virt` machine
//! exposes, as described in the virtio specification sections 4.2 and 5.2.
//! One request virtqueue; each request is the classic three-descriptor
//! chain:
//!
//! 1. **Header** (device-readable): request type + starting sector
//! 2. **Data** (device-writable for read, device-readable for write)
//! 3. **Status** (device-writable): single byte result
//!
//! Completion is synchronous: the driver polls the used ring, so callers
//! must not hold any spin-lock across a request. Device-reported errors
//! are fatal in this teaching core.
//!
//! # QEMU usage
//!
//! ```text
//! -drive file=fs.img,if=none,format=raw,id=x0 -device virtio-blk-device,drive=x0
//! ```

#![allow(dead_code)]

use core::ptr;
use core::sync::atomic::{fence, Ordering};

use spin::Mutex;

use super::{BlockDevice, BSIZE};
use crate::error::KernelError;
use crate::mm::{frame::FrameAllocator, PhysAddr, PGSIZE};

/// Queue size (number of descriptors). Must be a power of two.
const QUEUE_NUM: usize = 8;

/// Virtio sectors are 512 bytes; one of our blocks is eight of them.
const SECTORS_PER_BLOCK: u64 = (BSIZE / 512) as u64;

/// MMIO register offsets (virtio spec 4.2.2, legacy layout).
mod regs {
    pub const MAGIC_VALUE: usize = 0x000;
    pub const VERSION: usize = 0x004;
    pub const DEVICE_ID: usize = 0x008;
    pub const VENDOR_ID: usize = 0x00c;
    pub const DEVICE_FEATURES: usize = 0x010;
    pub const DRIVER_FEATURES: usize = 0x020;
    pub const GUEST_PAGE_SIZE: usize = 0x028;
    pub const QUEUE_SEL: usize = 0x030;
    pub const QUEUE_NUM_MAX: usize = 0x034;
    pub const QUEUE_NUM: usize = 0x038;
    pub const QUEUE_ALIGN: usize = 0x03c;
    pub const QUEUE_PFN: usize = 0x040;
    pub const QUEUE_NOTIFY: usize = 0x050;
    pub const INTERRUPT_STATUS: usize = 0x060;
    pub const INTERRUPT_ACK: usize = 0x064;
    pub const STATUS: usize = 0x070;
    /// Device config space; for blk, capacity in sectors as u64.
    pub const CONFIG: usize = 0x100;
}

/// Device status bits (virtio spec 2.1).
mod status {
    pub const ACKNOWLEDGE: u32 = 1;
    pub const DRIVER: u32 = 2;
    pub const DRIVER_OK: u32 = 4;
    pub const FEATURES_OK: u32 = 8;
}

/// Feature bits the driver refuses to negotiate.
mod features {
    pub const VIRTIO_BLK_F_RO: u32 = 1 << 5;
    pub const VIRTIO_BLK_F_SCSI: u32 = 1 << 7;
    pub const VIRTIO_BLK_F_CONFIG_WCE: u32 = 1 << 11;
    pub const VIRTIO_BLK_F_MQ: u32 = 1 << 12;
    pub const VIRTIO_F_ANY_LAYOUT: u32 = 1 << 27;
    pub const VIRTIO_RING_F_INDIRECT_DESC: u32 = 1 << 28;
    pub const VIRTIO_RING_F_EVENT_IDX: u32 = 1 << 29;
}

/// Virtio-blk request types (virtio spec 5.2.6).
mod req_type {
    pub const VIRTIO_BLK_T_IN: u32 = 0;
    pub const VIRTIO_BLK_T_OUT: u32 = 1;
}

/// Status byte values written by the device.
mod blk_status {
    pub const VIRTIO_BLK_S_OK: u8 = 0;
    pub const VIRTIO_BLK_S_IOERR: u8 = 1;
    pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;
}

const VIRTQ_DESC_F_NEXT: u16 = 1;
const VIRTQ_DESC_F_WRITE: u16 = 2;

/// Split-ring descriptor (virtio spec 2.6.5).
#[repr(C)]
#[derive(Clone, Copy)]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

#[repr(C)]
struct VirtqAvail {
    flags: u16,
    idx: u16,
    ring: [u16; QUEUE_NUM],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct VirtqUsedElem {
    id: u32,
    len: u32,
}

#[repr(C)]
struct VirtqUsed {
    flags: u16,
    idx: u16,
    ring: [VirtqUsedElem; QUEUE_NUM],
}

/// Request header, first descriptor of every chain.
#[repr(C)]
struct VirtioBlkReqHeader {
    type_: u32,
    reserved: u32,
    sector: u64,
}

/// Mutable ring state, behind one lock: descriptor table bookkeeping plus
/// the DMA page holding header/status staging.
struct Ring {
    /// Page holding desc table + avail ring (legacy layout).
    queue_page: PhysAddr,
    /// Page holding the used ring.
    used_page: PhysAddr,
    /// Page staging request headers and status bytes.
    req_page: PhysAddr,
    free: [bool; QUEUE_NUM],
    last_used_idx: u16,
}

impl Ring {
    fn desc(&self) -> *mut VirtqDesc {
        self.queue_page.as_mut_ptr::<VirtqDesc>()
    }

    fn avail(&self) -> *mut VirtqAvail {
        self.queue_page
            .add(QUEUE_NUM * core::mem::size_of::<VirtqDesc>())
            .as_mut_ptr::<VirtqAvail>()
    }

    fn used(&self) -> *mut VirtqUsed {
        self.used_page.as_mut_ptr::<VirtqUsed>()
    }

    fn alloc_desc(&mut self) -> Option<u16> {
        for (i, free) in self.free.iter_mut().enumerate() {
            if *free {
                *free = false;
                return Some(i as u16);
            }
        }
        None
    }

    fn free_chain(&mut self, mut i: u16) {
        loop {
            // SAFETY: `i` indexes the descriptor table page we own.
            let desc = unsafe { ptr::read_volatile(self.desc().add(i as usize)) };
            self.free[i as usize] = true;
            if desc.flags & VIRTQ_DESC_F_NEXT == 0 {
                break;
            }
            i = desc.next;
        }
    }
}

/// A virtio-mmio block device.
pub struct VirtioBlk {
    base: usize,
    capacity_sectors: u64,
    read_only: bool,
    ring: Mutex<Ring>,
}

impl VirtioBlk {
    fn read_reg(base: usize, off: usize) -> u32 {
        // SAFETY: `base` is the caller-attested MMIO window of a virtio
        // device; register reads have no side effects beyond the device's.
        unsafe { ptr::read_volatile((base + off) as *const u32) }
    }

    fn write_reg(base: usize, off: usize, value: u32) {
        // SAFETY: as in `read_reg`.
        unsafe { ptr::write_volatile((base + off) as *mut u32, value) }
    }

    /// Probe and initialize the device behind the MMIO window at `base`.
    ///
    /// Follows the legacy initialization sequence: reset, ACKNOWLEDGE,
    /// DRIVER, feature negotiation, queue setup, DRIVER_OK.
    ///
    /// # Safety
    ///
    /// `base` must be the physical address of a virtio-mmio register
    /// block, mapped for the kernel, and not driven by anyone else.
    pub unsafe fn new(base: usize, alloc: &FrameAllocator) -> Result<Self, KernelError> {
        if Self::read_reg(base, regs::MAGIC_VALUE) != 0x7472_6976
            || Self::read_reg(base, regs::VERSION) != 1
            || Self::read_reg(base, regs::DEVICE_ID) != 2
        {
            return Err(KernelError::HardwareError {
                device: "virtio-blk",
                code: 0x01, // not a legacy virtio-mmio block device
            });
        }

        // Reset, then announce ourselves.
        let mut st = 0;
        Self::write_reg(base, regs::STATUS, st);
        st |= status::ACKNOWLEDGE;
        Self::write_reg(base, regs::STATUS, st);
        st |= status::DRIVER;
        Self::write_reg(base, regs::STATUS, st);

        // Negotiate features: plain split ring, no extras.
        let mut feats = Self::read_reg(base, regs::DEVICE_FEATURES);
        let read_only = feats & features::VIRTIO_BLK_F_RO != 0;
        feats &= !(features::VIRTIO_BLK_F_RO
            | features::VIRTIO_BLK_F_SCSI
            | features::VIRTIO_BLK_F_CONFIG_WCE
            | features::VIRTIO_BLK_F_MQ
            | features::VIRTIO_F_ANY_LAYOUT
            | features::VIRTIO_RING_F_INDIRECT_DESC
            | features::VIRTIO_RING_F_EVENT_IDX);
        Self::write_reg(base, regs::DRIVER_FEATURES, feats);
        st |= status::FEATURES_OK;
        Self::write_reg(base, regs::STATUS, st);

        // Queue 0 setup: legacy PFN interface, page-sized alignment.
        Self::write_reg(base, regs::GUEST_PAGE_SIZE, PGSIZE as u32);
        Self::write_reg(base, regs::QUEUE_SEL, 0);
        let max = Self::read_reg(base, regs::QUEUE_NUM_MAX);
        if max == 0 || (max as usize) < QUEUE_NUM {
            return Err(KernelError::HardwareError {
                device: "virtio-blk",
                code: 0x02, // queue missing or too small
            });
        }
        Self::write_reg(base, regs::QUEUE_NUM, QUEUE_NUM as u32);

        let queue_page = alloc.alloc_frame().ok_or(KernelError::ResourceExhausted {
            resource: "physical frames",
        })?;
        let used_page = alloc.alloc_frame().ok_or(KernelError::ResourceExhausted {
            resource: "physical frames",
        })?;
        let req_page = alloc.alloc_frame().ok_or(KernelError::ResourceExhausted {
            resource: "physical frames",
        })?;
        Self::write_reg(base, regs::QUEUE_ALIGN, PGSIZE as u32);
        Self::write_reg(
            base,
            regs::QUEUE_PFN,
            (queue_page.as_usize() / PGSIZE) as u32,
        );

        st |= status::DRIVER_OK;
        Self::write_reg(base, regs::STATUS, st);

        // Capacity lives at the head of config space, in sectors.
        let lo = Self::read_reg(base, regs::CONFIG) as u64;
        let hi = Self::read_reg(base, regs::CONFIG + 4) as u64;
        let capacity_sectors = (hi << 32) | lo;

        log::info!(
            "virtio-blk: {} sectors at {:#x}{}",
            capacity_sectors,
            base,
            if read_only { " (read-only)" } else { "" }
        );

        Ok(Self {
            base,
            capacity_sectors,
            read_only,
            ring: Mutex::new(Ring {
                queue_page,
                used_page,
                req_page,
                free: [true; QUEUE_NUM],
                last_used_idx: 0,
            }),
        })
    }

    /// Submit one request and poll for its completion.
    ///
    /// `data_pa` is the physical address of a BSIZE buffer the device
    /// reads from (write) or writes into (read).
    fn do_request(&self, write: bool, block_no: u32, data_pa: PhysAddr) -> Result<(), KernelError> {
        if (block_no as u64 + 1) * SECTORS_PER_BLOCK > self.capacity_sectors {
            return Err(KernelError::HardwareError {
                device: "virtio-blk",
                code: 0x03, // block beyond device capacity
            });
        }
        if write && self.read_only {
            return Err(KernelError::PermissionDenied {
                operation: "write to a read-only virtio-blk device",
            });
        }

        let mut ring = self.ring.lock();

        // Three descriptors; QUEUE_NUM >= 3 guarantees they exist because
        // requests are serialized by the ring lock.
        let d_header = match ring.alloc_desc() {
            Some(d) => d,
            None => {
                return Err(KernelError::ResourceExhausted {
                    resource: "virtio descriptors",
                })
            }
        };
        let d_data = match ring.alloc_desc() {
            Some(d) => d,
            None => {
                ring.free[d_header as usize] = true;
                return Err(KernelError::ResourceExhausted {
                    resource: "virtio descriptors",
                });
            }
        };
        let d_status = match ring.alloc_desc() {
            Some(d) => d,
            None => {
                ring.free[d_header as usize] = true;
                ring.free[d_data as usize] = true;
                return Err(KernelError::ResourceExhausted {
                    resource: "virtio descriptors",
                });
            }
        };

        // Stage the header and status byte in the request page.
        let header_pa = ring.req_page;
        let status_pa = ring.req_page.add(core::mem::size_of::<VirtioBlkReqHeader>());
        // SAFETY: req_page is a private DMA frame owned by this ring.
        unsafe {
            ptr::write_volatile(
                header_pa.as_mut_ptr::<VirtioBlkReqHeader>(),
                VirtioBlkReqHeader {
                    type_: if write {
                        req_type::VIRTIO_BLK_T_OUT
                    } else {
                        req_type::VIRTIO_BLK_T_IN
                    },
                    reserved: 0,
                    sector: block_no as u64 * SECTORS_PER_BLOCK,
                },
            );
            ptr::write_volatile(status_pa.as_mut_ptr::<u8>(), 0xff);
        }

        let data_flags = if write {
            VIRTQ_DESC_F_NEXT
        } else {
            VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE
        };
        // SAFETY: the descriptor indices were just allocated and the
        // addresses point into frames owned by this driver / the cache.
        unsafe {
            ptr::write_volatile(
                ring.desc().add(d_header as usize),
                VirtqDesc {
                    addr: header_pa.as_usize() as u64,
                    len: core::mem::size_of::<VirtioBlkReqHeader>() as u32,
                    flags: VIRTQ_DESC_F_NEXT,
                    next: d_data,
                },
            );
            ptr::write_volatile(
                ring.desc().add(d_data as usize),
                VirtqDesc {
                    addr: data_pa.as_usize() as u64,
                    len: BSIZE as u32,
                    flags: data_flags,
                    next: d_status,
                },
            );
            ptr::write_volatile(
                ring.desc().add(d_status as usize),
                VirtqDesc {
                    addr: status_pa.as_usize() as u64,
                    len: 1,
                    flags: VIRTQ_DESC_F_WRITE,
                    next: 0,
                },
            );
        }

        // Publish the chain head and notify.
        // SAFETY: avail ring lives in the queue page owned by this ring.
        unsafe {
            let avail = ring.avail();
            let idx = ptr::read_volatile(ptr::addr_of!((*avail).idx));
            ptr::write_volatile(
                ptr::addr_of_mut!((*avail).ring[idx as usize % QUEUE_NUM]),
                d_header,
            );
            fence(Ordering::Release);
            ptr::write_volatile(ptr::addr_of_mut!((*avail).idx), idx.wrapping_add(1));
        }
        fence(Ordering::Release);
        Self::write_reg(self.base, regs::QUEUE_NOTIFY, 0);

        // Poll the used ring; the full kernel sleeps on the device
        // interrupt instead.
        loop {
            fence(Ordering::Acquire);
            // SAFETY: used ring lives in a frame owned by this ring.
            let used_idx = unsafe { ptr::read_volatile(ptr::addr_of!((*ring.used()).idx)) };
            if used_idx != ring.last_used_idx {
                break;
            }
            core::hint::spin_loop();
        }
        ring.last_used_idx = ring.last_used_idx.wrapping_add(1);

        // SAFETY: status byte was written by the device before it bumped
        // the used index.
        let code = unsafe { ptr::read_volatile(status_pa.as_ptr::<u8>()) };
        ring.free_chain(d_header);
        drop(ring);

        match code {
            blk_status::VIRTIO_BLK_S_OK => Ok(()),
            code => panic!(
                "virtio-blk: block {} {} failed with status {}",
                block_no,
                if write { "write" } else { "read" },
                code
            ),
        }
    }
}

impl BlockDevice for VirtioBlk {
    fn read_block(&self, block_no: u32, buf: &mut [u8]) -> Result<(), KernelError> {
        if buf.len() < BSIZE {
            return Err(KernelError::InvalidArgument {
                name: "buf",
                value: "shorter than one block",
            });
        }
        // DMA directly into the caller's buffer; buffers handed in by the
        // cache are frame-backed and identity-mapped.
        self.do_request(false, block_no, PhysAddr::new(buf.as_mut_ptr() as usize))
    }

    fn write_block(&self, block_no: u32, data: &[u8]) -> Result<(), KernelError> {
        if data.len() < BSIZE {
            return Err(KernelError::InvalidArgument {
                name: "data",
                value: "shorter than one block",
            });
        }
        self.do_request(true, block_no, PhysAddr::new(data.as_ptr() as usize))
    }

    fn block_count(&self) -> u32 {
        (self.capacity_sectors / SECTORS_PER_BLOCK) as u32
    }
}
