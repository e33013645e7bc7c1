//! Architecture-specific context switching
//!
//! Each architecture provides:
//! - `SavedContext`: the callee-saved register image of a suspended fiber
//! - `init_context`: prepare a fresh context that enters the trampoline
//! - `context_switch`: save the current registers and load another image
//!
//! Hand-written assembly; the layout of `SavedContext` is part of the
//! contract with the asm and must not be reordered.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{SavedContext, context_switch, init_context};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{SavedContext, context_switch, init_context};
    } else {
        compile_error!("weft-runtime: unsupported architecture");
    }
}
