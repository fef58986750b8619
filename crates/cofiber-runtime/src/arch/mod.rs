//! Architecture-specific context switching
//!
//! Each backend exposes the same surface:
//!
//! - `SavedRegs` - callee-saved register block, `repr(C)` so the assembly can
//!   address it by fixed offsets
//! - `init_context` - prime a register block so that switching to it enters
//!   `entry(arg)` on a fresh stack
//! - `switch_context` - save the current registers, load another block
//! - `load_context` - load a block without saving anything (one-way)

/// Entry function for a freshly initialized context
///
/// It runs on the new stack and must never return; it leaves by loading
/// another context.
pub type EntryFn = extern "C" fn(usize) -> !;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::{SavedRegs, init_context, switch_context, load_context};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64::{SavedRegs, init_context, switch_context, load_context};
    } else {
        compile_error!("Unsupported architecture");
    }
}
