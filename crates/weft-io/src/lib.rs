//! # weft-io
//!
//! The I/O half of the weft runtime:
//!
//! - [`io_manager::IoManager`]: an epoll reactor layered on the
//!   scheduler (its idle path is `epoll_wait` + timer drain; its wake is
//!   a self-pipe byte)
//! - [`fd_manager::FdManager`]: the process-wide per-fd flag registry
//! - [`hook`]: the blocking-style syscall surface that parks fibers
//!   instead of threads
//! - [`net`]: TCP listener/stream convenience wrappers

pub mod fd_context;
pub mod fd_manager;
pub mod hook;
pub mod io_manager;
pub mod net;

// Re-exports
pub use fd_context::{FdContext, IoEvent};
pub use fd_manager::{FdInfo, FdManager, TimeoutKind};
pub use io_manager::IoManager;
pub use net::{Listener, Stream};
