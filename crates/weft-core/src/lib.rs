//! # weft-core
//!
//! Platform-independent core types for the weft fiber runtime:
//!
//! - Fiber identifiers and states
//! - Error types shared by the runtime crates
//! - Environment variable helpers for configuration
//! - Leveled stderr log macros

pub mod env;
pub mod error;
pub mod id;
pub mod log;
pub mod state;

// Re-exports
pub use env::{env_get, env_get_bool};
pub use error::{MemoryError, SchedError, SchedResult};
pub use id::FiberId;
pub use state::FiberState;
