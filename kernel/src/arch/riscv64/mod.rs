//! RISC-V Sv39 CSR glue

use riscv::register::satp;

use crate::mm::{user_space::UserAddressSpace, PhysAddr};

/// Switch translation to the given root table and flush the TLB.
///
/// # Safety
///
/// The table must map the currently executing kernel text and stack, or
/// the next instruction fetch faults unrecoverably.
pub unsafe fn activate(root: PhysAddr) {
    // SAFETY: contract passed through to the caller.
    unsafe {
        satp::set(satp::Mode::Sv39, 0, root.as_usize() >> 12);
        riscv::asm::sfence_vma_all();
    }
}

/// Switch to a user address space.
///
/// # Safety
///
/// As [`activate`]; the space must include the trampoline mappings.
pub unsafe fn activate_user(space: &UserAddressSpace) {
    // SAFETY: contract passed through to the caller.
    unsafe { activate(space.table().root_pa()) }
}

/// Invalidate the cached translation for one page.
#[inline]
pub fn flush_page(va: usize) {
    // SAFETY: sfence.vma with an address argument only drops TLB entries.
    unsafe { riscv::asm::sfence_vma(0, va) }
}
