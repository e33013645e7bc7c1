//! Per-fd event state
//!
//! One `FdContext` per file descriptor, created lazily on first arm and
//! kept for the life of the reactor. The kernel hands its address back
//! through `epoll_event.data`, which is how the reactor finds the waiter
//! for a ready event.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};
use weft_core::state::FiberState;
use weft_runtime::fiber::Fiber;
use weft_runtime::scheduler::{Scheduler, Task};

/// An armable event kind. The values match the epoll bits so masks can
/// be passed straight through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IoEvent {
    Read = libc::EPOLLIN as u32,
    Write = libc::EPOLLOUT as u32,
}

impl IoEvent {
    #[inline]
    pub fn mask(self) -> u32 {
        self as u32
    }
}

/// Who gets run when an armed event fires.
pub(crate) enum Waiter {
    Fiber(Arc<Fiber>),
    Callback(Box<dyn FnOnce() + Send>),
}

/// One armed-event slot: the waiter plus the scheduler to run it on.
#[derive(Default)]
pub(crate) struct EventSlot {
    pub scheduler: Option<Arc<Scheduler>>,
    pub waiter: Option<Waiter>,
}

/// Mutable event state of one fd, behind the per-fd mutex.
pub(crate) struct FdEvents {
    /// Mask of currently armed events (EPOLLIN/EPOLLOUT bits)
    pub events: u32,
    pub read: EventSlot,
    pub write: EventSlot,
}

/// Per-fd record: the fd plus its armed events and waiters.
pub struct FdContext {
    fd: RawFd,
    state: Mutex<FdEvents>,
}

impl FdContext {
    pub(crate) fn new(fd: RawFd) -> FdContext {
        FdContext {
            fd,
            state: Mutex::new(FdEvents {
                events: 0,
                read: EventSlot::default(),
                write: EventSlot::default(),
            }),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FdEvents> {
        self.state.lock().unwrap()
    }
}

impl FdEvents {
    pub(crate) fn slot_mut(&mut self, ev: IoEvent) -> &mut EventSlot {
        match ev {
            IoEvent::Read => &mut self.read,
            IoEvent::Write => &mut self.write,
        }
    }

    /// Record the waiter for a newly armed event. With no callback the
    /// currently running fiber is the waiter.
    pub(crate) fn arm(
        &mut self,
        ev: IoEvent,
        sched: Arc<Scheduler>,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) {
        self.events |= ev.mask();
        let slot = self.slot_mut(ev);
        debug_assert!(
            slot.waiter.is_none() && slot.scheduler.is_none(),
            "event slot is dirty"
        );
        slot.scheduler = Some(sched);
        slot.waiter = Some(match cb {
            Some(cb) => Waiter::Callback(cb),
            None => {
                let f = Fiber::current();
                debug_assert_eq!(f.state(), FiberState::Running);
                Waiter::Fiber(f)
            }
        });
    }

    /// Clear an event without running its waiter.
    pub(crate) fn discard(&mut self, ev: IoEvent) {
        self.events &= !ev.mask();
        let slot = self.slot_mut(ev);
        slot.scheduler = None;
        slot.waiter = None;
    }

    /// Clear an event and hand its waiter to the recorded scheduler.
    /// Fires at most once per arm.
    pub(crate) fn fire(&mut self, ev: IoEvent) {
        self.events &= !ev.mask();
        let slot = self.slot_mut(ev);
        let sched = slot.scheduler.take();
        let waiter = slot.waiter.take();
        if let (Some(sched), Some(waiter)) = (sched, waiter) {
            match waiter {
                Waiter::Fiber(f) => sched.schedule(Task::fiber(f, None)),
                Waiter::Callback(cb) => sched.schedule(Task {
                    kind: weft_runtime::scheduler::TaskKind::Callback(cb),
                    affinity: None,
                }),
            }
        }
    }
}
