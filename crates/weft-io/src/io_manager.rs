//! The epoll reactor
//!
//! An `IoManager` is a scheduler whose idle path blocks in `epoll_wait`
//! with the nearest timer deadline as its timeout, and whose wake signal
//! is a byte down a self-pipe. Suspended fibers are recorded per fd and
//! per direction; when the kernel reports readiness the reactor requeues
//! them on the scheduler.
//!
//! Every epoll registration is edge-triggered and one-shot in effect:
//! fired events are removed from the fd's mask and must be re-armed.

use crate::fd_context::{FdContext, IoEvent};
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use weft_core::error::{SchedError, SchedResult};
use weft_core::{werror, winfo};
use weft_runtime::config::RuntimeConfig;
use weft_runtime::fiber::Fiber;
use weft_runtime::scheduler::{Driver, Scheduler, Task};
use weft_runtime::timer::{Timer, TimerCallback, TimerManager};

thread_local! {
    static CURRENT_IOM: RefCell<Option<Arc<IoManager>>> = const { RefCell::new(None) };
}

#[inline]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// Epoll-driven I/O scheduler with integrated timers.
pub struct IoManager {
    sched: Arc<Scheduler>,
    timers: Arc<TimerManager>,
    epfd: RawFd,
    tickle_fds: [RawFd; 2],
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
    pending_events: AtomicUsize,
    config: RuntimeConfig,
    self_weak: RwLock<Weak<IoManager>>,
}

impl IoManager {
    /// Build the reactor and start its workers.
    ///
    /// With `use_caller` the constructing thread counts toward
    /// `worker_count` and drains the pool when `stop` is called (from
    /// that same thread).
    pub fn new(
        worker_count: usize,
        use_caller: bool,
        name: &str,
        config: RuntimeConfig,
    ) -> SchedResult<Arc<IoManager>> {
        weft_core::log::init();
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(SchedError::Epoll(errno()));
        }
        let mut pipe_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
            let e = errno();
            unsafe { libc::close(epfd) };
            return Err(SchedError::WakePipe(e));
        }
        // The read end must be non-blocking: wakes are drained to EAGAIN
        if unsafe { libc::fcntl(pipe_fds[0], libc::F_SETFL, libc::O_NONBLOCK) } != 0 {
            let e = errno();
            unsafe {
                libc::close(epfd);
                libc::close(pipe_fds[0]);
                libc::close(pipe_fds[1]);
            }
            return Err(SchedError::WakePipe(e));
        }
        // Self-pipe registration carries the fd, not a context pointer;
        // that is how it is discriminated in the idle loop
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: pipe_fds[0] as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev) } != 0 {
            let e = errno();
            unsafe {
                libc::close(epfd);
                libc::close(pipe_fds[0]);
                libc::close(pipe_fds[1]);
            }
            return Err(SchedError::Epoll(e));
        }

        let sched = Scheduler::new(worker_count, use_caller, name, config.clone());
        let iom = Arc::new(IoManager {
            sched,
            timers: TimerManager::new(),
            epfd,
            tickle_fds: pipe_fds,
            fd_contexts: RwLock::new(Vec::new()),
            pending_events: AtomicUsize::new(0),
            config,
            self_weak: RwLock::new(Weak::new()),
        });
        *iom.self_weak.write().unwrap() = Arc::downgrade(&iom);

        // A timer that becomes the new front must wake a blocked
        // epoll_wait so it can shorten its timeout
        {
            let w = Arc::downgrade(&iom);
            iom.timers.set_notify(Box::new(move || {
                if let Some(m) = w.upgrade() {
                    m.tickle_pipe();
                }
            }));
        }
        let wd: Weak<dyn Driver> = iom.self_weak.read().unwrap().clone();
        iom.sched.set_driver(wd);
        iom.resize_contexts(32);
        if use_caller {
            set_current(Some(iom.clone()));
        }
        iom.sched.start()?;
        winfo!("{}: reactor up ({} workers)", iom.sched.name(), worker_count);
        Ok(iom)
    }

    /// The reactor the calling thread works for, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT_IOM.with(|c| c.borrow().clone())
    }

    #[inline]
    pub fn sched(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Armed events not yet fired or cancelled.
    #[inline]
    pub fn pending_events(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    /// Graceful shutdown; see `Scheduler::stop`. Returns once all queued
    /// tasks have run and pending I/O has been fired or cancelled.
    pub fn stop(&self) {
        self.sched.stop();
    }

    // ── Scheduling and timer forwarding ──

    pub fn schedule(&self, task: Task) {
        self.sched.schedule(task);
    }

    pub fn schedule_fiber(&self, f: Arc<Fiber>, affinity: Option<usize>) {
        self.sched.schedule_fiber(f, affinity);
    }

    pub fn schedule_callback<F: FnOnce() + Send + 'static>(&self, f: F, affinity: Option<usize>) {
        self.sched.schedule_callback(f, affinity);
    }

    pub fn add_timer(&self, period_ms: u64, cb: TimerCallback, recurring: bool) -> Timer {
        self.timers.add_timer(period_ms, cb, recurring)
    }

    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        period_ms: u64,
        cb: TimerCallback,
        cond: std::sync::Weak<T>,
    ) -> Timer {
        self.timers.add_condition_timer(period_ms, cb, cond)
    }

    // ── Event arming ──

    /// Arm `ev` on `fd`. The waiter is `cb` if given, else the currently
    /// running fiber, which the caller is expected to park right after.
    ///
    /// Panics if the event is already armed (programming error); fails
    /// if the kernel refuses the registration.
    pub fn add_event(
        &self,
        fd: RawFd,
        ev: IoEvent,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> SchedResult<()> {
        let ctx = self.context_for(fd);
        let mut st = ctx.lock();
        assert!(
            st.events & ev.mask() == 0,
            "add_event: fd {} event {:?} already armed (mask {:#x})",
            fd,
            ev,
            st.events
        );
        let op = if st.events != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let mut epev = libc::epoll_event {
            events: libc::EPOLLET as u32 | st.events | ev.mask(),
            u64: Arc::as_ptr(&ctx) as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epev) } != 0 {
            let e = errno();
            werror!("add_event: epoll_ctl(fd={}, op={}) failed: errno {}", fd, op, e);
            return Err(SchedError::Epoll(e));
        }
        self.pending_events.fetch_add(1, Ordering::SeqCst);
        st.arm(ev, self.sched.clone(), cb);
        Ok(())
    }

    /// Disarm `ev` on `fd` without running the waiter.
    pub fn del_event(&self, fd: RawFd, ev: IoEvent) -> bool {
        let Some(ctx) = self.lookup_context(fd) else {
            return false;
        };
        let mut st = ctx.lock();
        if st.events & ev.mask() == 0 {
            return false;
        }
        let left = st.events & !ev.mask();
        if !self.epoll_rearm(fd, &ctx, left) {
            return false;
        }
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        st.discard(ev);
        true
    }

    /// Disarm `ev` on `fd` and run its waiter exactly once. This is how
    /// timeouts and close propagate cancellation into a parked fiber.
    pub fn cancel_event(&self, fd: RawFd, ev: IoEvent) -> bool {
        let Some(ctx) = self.lookup_context(fd) else {
            return false;
        };
        let mut st = ctx.lock();
        if st.events & ev.mask() == 0 {
            return false;
        }
        let left = st.events & !ev.mask();
        if !self.epoll_rearm(fd, &ctx, left) {
            return false;
        }
        st.fire(ev);
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Fire every armed waiter on `fd` (read then write) and remove the
    /// fd from epoll.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.lookup_context(fd) else {
            return false;
        };
        let mut st = ctx.lock();
        if st.events == 0 {
            return false;
        }
        let mut epev = libc::epoll_event {
            events: 0,
            u64: Arc::as_ptr(&ctx) as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut epev) } != 0 {
            werror!("cancel_all: epoll_ctl(fd={}) failed: errno {}", fd, errno());
            return false;
        }
        if st.events & IoEvent::Read.mask() != 0 {
            st.fire(IoEvent::Read);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        if st.events & IoEvent::Write.mask() != 0 {
            st.fire(IoEvent::Write);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert_eq!(st.events, 0, "fd {} not fully cleared", fd);
        true
    }

    // ── Internals ──

    /// Re-register `fd` with the residual mask, or drop it from epoll
    /// when nothing is left.
    fn epoll_rearm(&self, fd: RawFd, ctx: &Arc<FdContext>, left: u32) -> bool {
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mut epev = libc::epoll_event {
            events: libc::EPOLLET as u32 | left,
            u64: Arc::as_ptr(ctx) as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epev) } != 0 {
            werror!("epoll_ctl(fd={}, op={}) failed: errno {}", fd, op, errno());
            return false;
        }
        true
    }

    /// Fd context, growing the vector by ~1.5x when the index is new.
    fn context_for(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "context_for: negative fd");
        let idx = fd as usize;
        {
            let v = self.fd_contexts.read().unwrap();
            if idx < v.len() {
                return v[idx].clone();
            }
        }
        let mut v = self.fd_contexts.write().unwrap();
        // Double check under the write lock
        if idx >= v.len() {
            let target = ((idx + 1) * 3 / 2).max(32);
            let mut i = v.len();
            while i < target {
                v.push(Arc::new(FdContext::new(i as RawFd)));
                i += 1;
            }
        }
        v[idx].clone()
    }

    fn lookup_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let v = self.fd_contexts.read().unwrap();
        v.get(fd as usize).cloned()
    }

    fn resize_contexts(&self, n: usize) {
        let mut v = self.fd_contexts.write().unwrap();
        let mut i = v.len();
        while i < n {
            v.push(Arc::new(FdContext::new(i as RawFd)));
            i += 1;
        }
    }

    /// Write one wake byte if anyone is blocked in the idle loop. The
    /// payload is meaningless; the reader drains and discards.
    fn tickle_pipe(&self) {
        if !self.sched.has_idle_workers() {
            return;
        }
        let b = b'T';
        unsafe {
            libc::write(self.tickle_fds[1], &b as *const u8 as *const libc::c_void, 1);
        }
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.tickle_fds[0],
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Handle one ready kernel event for a real fd.
    fn dispatch_ready(&self, ctx: &FdContext, mut kernel_events: u32) {
        let mut st = ctx.lock();
        // Error/hangup wakes both directions so waiters cannot get stuck
        // on a half-closed peer
        if kernel_events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            kernel_events |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & st.events;
        }
        let mut real = 0u32;
        if kernel_events & libc::EPOLLIN as u32 != 0 {
            real |= IoEvent::Read.mask();
        }
        if kernel_events & libc::EPOLLOUT as u32 != 0 {
            real |= IoEvent::Write.mask();
        }
        real &= st.events;
        if real == 0 {
            return;
        }
        let left = st.events & !real;
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mut epev = libc::epoll_event {
            events: libc::EPOLLET as u32 | left,
            u64: ctx as *const FdContext as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, ctx.fd(), &mut epev) } != 0 {
            werror!("idle: epoll_ctl(fd={}) failed: errno {}", ctx.fd(), errno());
            return;
        }
        if real & IoEvent::Read.mask() != 0 {
            st.fire(IoEvent::Read);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        if real & IoEvent::Write.mask() != 0 {
            st.fire(IoEvent::Write);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Driver for IoManager {
    fn tickle(&self, _sched: &Scheduler) {
        self.tickle_pipe();
    }

    fn on_worker_start(&self, _sched: &Scheduler) {
        if let Some(me) = self.self_weak.read().unwrap().upgrade() {
            set_current(Some(me));
        }
        crate::hook::set_enabled(true);
    }

    fn stopping(&self, sched: &Scheduler) -> bool {
        sched.base_stopping() && self.pending_events() == 0 && !self.timers.has_timer()
    }

    /// Reactor idle loop: block in epoll_wait bounded by the nearest
    /// timer, drain expired timers into tasks, requeue waiters of ready
    /// events, then yield so the dispatcher runs what was enqueued.
    fn idle(&self, sched: &Scheduler) {
        let batch = self.config.epoll_batch.max(1);
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; batch];
        let mut expired: Vec<TimerCallback> = Vec::new();

        loop {
            if Driver::stopping(self, sched) {
                winfo!("{}: reactor idle exiting", sched.name());
                break;
            }

            let timeout = self
                .timers
                .next_timer_delay()
                .map(|d| d.min(self.config.idle_block_ms))
                .unwrap_or(self.config.idle_block_ms) as i32;

            let n = loop {
                let r = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), batch as i32, timeout)
                };
                if r < 0 {
                    if errno() == libc::EINTR {
                        continue;
                    }
                    werror!("epoll_wait failed: errno {}", errno());
                    break 0;
                }
                break r as usize;
            };

            // 1. Expired timers become scheduler tasks
            expired.clear();
            self.timers.list_expired(&mut expired);
            for cb in expired.drain(..) {
                sched.schedule(Task::callback(move || cb(), None));
            }

            // 2. Ready fds wake their waiters
            for i in 0..n {
                let ev = events[i];
                if ev.u64 == self.tickle_fds[0] as u64 {
                    self.drain_tickle_pipe();
                    continue;
                }
                let ctx = unsafe { &*(ev.u64 as usize as *const FdContext) };
                self.dispatch_ready(ctx, ev.events);
            }

            // 3. Let the dispatcher run what we enqueued
            Fiber::current().yield_ready();
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

pub(crate) fn set_current(iom: Option<Arc<IoManager>>) {
    CURRENT_IOM.with(|c| *c.borrow_mut() = iom);
}
