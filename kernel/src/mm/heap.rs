//! Kernel heap
//!
//! Bare-metal builds back `alloc` with a linked-list heap over a region
//! the boot code hands in. Hosted builds (tests) use the system allocator
//! and never compile this module.

use linked_list_allocator::LockedHeap;

#[global_allocator]
static KERNEL_HEAP: LockedHeap = LockedHeap::empty();

/// Initialize the kernel heap. Called once, before the first allocation.
///
/// # Safety
///
/// `[start, start + size)` must be unused, writable memory that outlives
/// the kernel.
pub unsafe fn init(start: *mut u8, size: usize) {
    // SAFETY: contract passed through to the caller.
    unsafe {
        KERNEL_HEAP.lock().init(start, size);
    }
    log::info!("heap: {} KiB at {:p}", size / 1024, start);
}
