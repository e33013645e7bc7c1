//! # weft - stackful fiber runtime
//!
//! Application code is written as straight-line, apparently-blocking
//! procedures; the runtime multiplexes thousands of such fibers over a
//! small pool of CPU-pinned workers with non-blocking I/O underneath.
//!
//! ## Quick start
//!
//! ```ignore
//! use weft::{IoManager, RuntimeConfig, spawn, sleep_ms};
//!
//! let iom = IoManager::new(4, false, "weft", RuntimeConfig::from_env()).unwrap();
//! spawn(&iom, || {
//!     // Looks blocking; parks the fiber, not the thread
//!     sleep_ms(50);
//! }).unwrap();
//! iom.stop();
//! ```
//!
//! ## Layers
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │ user fibers: hook::read / write / sleep / net   │
//! └─────────────────────────────────────────────────┘
//!                        │
//! ┌─────────────────────────────────────────────────┐
//! │ IoManager: epoll + timers + self-pipe wake      │
//! └─────────────────────────────────────────────────┘
//!                        │
//! ┌─────────────────────────────────────────────────┐
//! │ Scheduler: private/public queues, work stealing │
//! └─────────────────────────────────────────────────┘
//!                        │
//! ┌─────────────────────────────────────────────────┐
//! │ Fiber: guard-paged stacks, context switches     │
//! └─────────────────────────────────────────────────┘
//! ```

// Core types
pub use weft_core::error::{MemoryError, SchedError, SchedResult};
pub use weft_core::id::FiberId;
pub use weft_core::log::{self, LogLevel};
pub use weft_core::state::FiberState;
pub use weft_core::{wdebug, werror, winfo, wtrace, wwarn};

// Runtime
pub use weft_runtime::config::RuntimeConfig;
pub use weft_runtime::fiber::Fiber;
pub use weft_runtime::scheduler::{yield_now, Scheduler, Task, TaskKind};
pub use weft_runtime::timer::{elapsed_ms, Timer, TimerCallback, TimerManager};
pub use weft_runtime::tls;

// I/O
pub use weft_io::hook::{self, sleep_ms};
pub use weft_io::{FdManager, IoEvent, IoManager, Listener, Stream, TimeoutKind};

use std::sync::Arc;

/// Spawn a fiber on the reactor's scheduler. Returns its id.
pub fn spawn<F>(iom: &Arc<IoManager>, f: F) -> SchedResult<FiberId>
where
    F: FnOnce() + Send + 'static,
{
    let fiber = Fiber::new(f, iom.config().stack_size, true)?;
    let id = fiber.id();
    iom.schedule_fiber(fiber, None);
    Ok(id)
}

/// As [`spawn`], pinning the fiber to one worker.
pub fn spawn_pinned<F>(iom: &Arc<IoManager>, worker: usize, f: F) -> SchedResult<FiberId>
where
    F: FnOnce() + Send + 'static,
{
    let fiber = Fiber::new(f, iom.config().stack_size, true)?;
    let id = fiber.id();
    iom.schedule_fiber(fiber, Some(worker));
    Ok(id)
}
