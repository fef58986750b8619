//! x86_64 context switching implementation (System V AMD64)
//!
//! Only callee-saved state is switched: the switch is always entered through
//! a regular `extern "C"` call, so the compiler has already spilled
//! everything caller-saved.

use super::EntryFn;
use std::arch::naked_asm;

/// Default MXCSR: all exceptions masked, round to nearest
const DEFAULT_MXCSR: u32 = 0x1F80;

/// Default x87 control word: all exceptions masked, 64-bit precision
const DEFAULT_FPUCW: u16 = 0x037F;

/// Saved callee-saved registers
///
/// Offsets are hard-coded in the assembly below.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedRegs {
    pub rsp: u64,   // 0x00
    pub rip: u64,   // 0x08
    pub rbx: u64,   // 0x10
    pub rbp: u64,   // 0x18
    pub r12: u64,   // 0x20
    pub r13: u64,   // 0x28
    pub r14: u64,   // 0x30
    pub r15: u64,   // 0x38
    pub mxcsr: u32, // 0x40
    pub fpucw: u16, // 0x44
    _pad: u16,
}

/// Initialize a new context
///
/// Sets up the registers so that when switched to, execution begins in
/// the trampoline, which calls `entry(arg)` on the given stack.
///
/// # Safety
///
/// `stack_top` must be the highest address of a writable stack region that
/// stays mapped for as long as the context can run.
#[inline]
pub unsafe fn init_context(regs: &mut SavedRegs, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    // The trampoline starts with rsp 16-byte aligned; its `call` then pushes
    // the return address, giving the callee the rsp % 16 == 8 the ABI expects.
    let sp = (stack_top as usize) & !0xF;

    *regs = SavedRegs::default();
    regs.rsp = sp as u64;
    regs.rip = fiber_trampoline as usize as u64;
    regs.r12 = entry as usize as u64;
    regs.r13 = arg as u64;
    regs.mxcsr = DEFAULT_MXCSR;
    regs.fpucw = DEFAULT_FPUCW;
}

/// First code executed on a fresh stack
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        // entry never returns
        "ud2",
    );
}

/// Save the current context into `save` and resume `load`
///
/// Returns when some other context switches back into `save`.
///
/// # Safety
///
/// `load` must hold a context produced by `init_context` or by a previous
/// `switch_context`, whose stack is still mapped and not running anywhere.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut SavedRegs, _load: *const SavedRegs) {
    naked_asm!(
        // Save callee-saved state to `save` (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "stmxcsr dword ptr [rdi + 0x40]",
        "fnstcw word ptr [rdi + 0x44]",
        // Load callee-saved state from `load` (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "ldmxcsr dword ptr [rsi + 0x40]",
        "fldcw word ptr [rsi + 0x44]",
        "jmp qword ptr [rsi + 0x08]",
        // Resume point for the saved context
        "2:",
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
        "mov rsp, [rdi + 0x00]",
        "mov rbx, [rdi + 0x10]",
        "mov rbp, [rdi + 0x18]",
        "mov r12, [rdi + 0x20]",
        "mov r13, [rdi + 0x28]",
        "mov r14, [rdi + 0x30]",
        "mov r15, [rdi + 0x38]",
        "ldmxcsr dword ptr [rdi + 0x40]",
        "fldcw word ptr [rdi + 0x44]",
        "jmp qword ptr [rdi + 0x08]",
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_layout_matches_asm() {
        assert_eq!(offset_of!(SavedRegs, rsp), 0x00);
        assert_eq!(offset_of!(SavedRegs, rip), 0x08);
        assert_eq!(offset_of!(SavedRegs, r15), 0x38);
        assert_eq!(offset_of!(SavedRegs, mxcsr), 0x40);
        assert_eq!(offset_of!(SavedRegs, fpucw), 0x44);
    }

    extern "C" fn never_called(_arg: usize) -> ! {
        unreachable!()
    }

    #[test]
    fn test_init_context_aligns_stack() {
        let mut regs = SavedRegs::default();
        let fake_top = 0x7000_1237usize as *mut u8;
        unsafe { init_context(&mut regs, fake_top, never_called, 7) };
        assert_eq!(regs.rsp % 16, 0);
        assert!(regs.rsp <= 0x7000_1237);
        assert_eq!(regs.r13, 7);
        assert_eq!(regs.mxcsr, DEFAULT_MXCSR);
    }
}
