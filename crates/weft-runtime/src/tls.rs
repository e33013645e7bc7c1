//! Thread-local runtime context
//!
//! Per-thread pointers used by the fiber primitives and the scheduler:
//! the currently running fiber, the thread's root fiber, the dispatch
//! fiber a scheduled fiber yields back into, the worker index, and the
//! scheduler the thread belongs to. None of these are ever mutated from
//! another thread.

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

thread_local! {
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static ROOT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static DISPATCH_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static WORKER_ID: Cell<usize> = const { Cell::new(usize::MAX) };
    static SCHEDULER: RefCell<Option<Arc<Scheduler>>> = const { RefCell::new(None) };
}

/// Fiber currently executing on this thread, if any.
#[inline]
pub fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|c| c.borrow().clone())
}

#[inline]
pub fn set_current_fiber(f: Option<Arc<Fiber>>) {
    CURRENT_FIBER.with(|c| *c.borrow_mut() = f);
}

/// This thread's root fiber (the wrapped original execution), if created.
#[inline]
pub fn root_fiber() -> Option<Arc<Fiber>> {
    ROOT_FIBER.with(|c| c.borrow().clone())
}

#[inline]
pub fn set_root_fiber(f: Option<Arc<Fiber>>) {
    ROOT_FIBER.with(|c| *c.borrow_mut() = f);
}

/// The dispatch fiber scheduled fibers yield back into on this thread.
#[inline]
pub fn dispatch_fiber() -> Option<Arc<Fiber>> {
    DISPATCH_FIBER.with(|c| c.borrow().clone())
}

#[inline]
pub fn set_dispatch_fiber(f: Option<Arc<Fiber>>) {
    DISPATCH_FIBER.with(|c| *c.borrow_mut() = f);
}

/// Worker index of this thread, or `usize::MAX` when not a worker.
#[inline]
pub fn worker_id() -> usize {
    WORKER_ID.with(|c| c.get())
}

#[inline]
pub fn set_worker_id(id: usize) {
    WORKER_ID.with(|c| c.set(id));
}

/// Scheduler this thread works for, if any.
#[inline]
pub fn current_scheduler() -> Option<Arc<Scheduler>> {
    SCHEDULER.with(|c| c.borrow().clone())
}

#[inline]
pub fn set_current_scheduler(s: Option<Arc<Scheduler>>) {
    SCHEDULER.with(|c| *c.borrow_mut() = s);
}
