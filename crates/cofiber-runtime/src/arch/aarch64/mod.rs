//! aarch64 context switching implementation (AAPCS64)
//!
//! Callee-saved state: x19-x28, the frame pointer (x29), the link register
//! (x30), sp and the low halves of v8-v15.

use super::EntryFn;
use std::arch::naked_asm;

/// Saved callee-saved registers
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedRegs {
    /// x19..=x30 (x29 = fp, x30 = lr)
    pub gpr: [u64; 12], // 0x00
    pub sp: u64,        // 0x60
    /// d8..=d15
    pub fpr: [u64; 8],  // 0x68
}

/// Initialize a new context
///
/// # Safety
///
/// `stack_top` must be the highest address of a writable stack region that
/// stays mapped for as long as the context can run.
#[inline]
pub unsafe fn init_context(regs: &mut SavedRegs, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    *regs = SavedRegs::default();
    regs.sp = ((stack_top as usize) & !0xF) as u64;
    regs.gpr[0] = entry as usize as u64; // x19
    regs.gpr[1] = arg as u64; // x20
    regs.gpr[11] = fiber_trampoline as usize as u64; // lr
}

/// First code executed on a fresh stack
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        // entry never returns
        "brk #0x1",
    );
}

/// Save the current context into `save` and resume `load`
///
/// # Safety
///
/// `load` must hold a context produced by `init_context` or by a previous
/// `switch_context`, whose stack is still mapped and not running anywhere.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut SavedRegs, _load: *const SavedRegs) {
    naked_asm!(
        // Save to `save` (x0)
        "stp x19, x20, [x0, #0x00]",
        "stp x21, x22, [x0, #0x10]",
        "stp x23, x24, [x0, #0x20]",
        "stp x25, x26, [x0, #0x30]",
        "stp x27, x28, [x0, #0x40]",
        "stp x29, x30, [x0, #0x50]",
        "mov x9, sp",
        "str x9, [x0, #0x60]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Load from `load` (x1)
        "ldp x19, x20, [x1, #0x00]",
        "ldp x21, x22, [x1, #0x10]",
        "ldp x23, x24, [x1, #0x20]",
        "ldp x25, x26, [x1, #0x30]",
        "ldp x27, x28, [x1, #0x40]",
        "ldp x29, x30, [x1, #0x50]",
        "ldr x9, [x1, #0x60]",
        "mov sp, x9",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        // Return through the loaded lr
        "ret",
    );
}

/// Resume `load` without saving the current context
///
/// # Safety
///
/// Same requirements as `switch_context`. The calling context is abandoned.
#[unsafe(naked)]
pub unsafe extern "C" fn load_context(_load: *const SavedRegs) -> ! {
    naked_asm!(
        "ldp x19, x20, [x0, #0x00]",
        "ldp x21, x22, [x0, #0x10]",
        "ldp x23, x24, [x0, #0x20]",
        "ldp x25, x26, [x0, #0x30]",
        "ldp x27, x28, [x0, #0x40]",
        "ldp x29, x30, [x0, #0x50]",
        "ldr x9, [x0, #0x60]",
        "mov sp, x9",
        "ldp d8, d9, [x0, #0x68]",
        "ldp d10, d11, [x0, #0x78]",
        "ldp d12, d13, [x0, #0x88]",
        "ldp d14, d15, [x0, #0x98]",
        "ret",
    );
}
