//! M:N work-stealing fiber scheduler
//!
//! N worker threads, each an independent dispatcher. Every worker owns a
//! private queue (touched only by itself, no lock) and a public queue
//! (mutex-protected, visible to all). Tasks carry an optional affinity
//! naming the one worker allowed to run them; affinity-free tasks may be
//! stolen.
//!
//! Dispatch order per worker: drain own private queue, take from own
//! public queue, steal an affinity-free task from another worker's public
//! queue, otherwise resume the idle fiber. The idle strategy and the
//! wake signal are pluggable through [`Driver`] so the reactor can
//! substitute an epoll wait for the base busy-yield.

use crate::config::RuntimeConfig;
use crate::fiber::Fiber;
use crate::thread::{self, Thread};
use crate::tls;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use weft_core::error::{SchedError, SchedResult};
use weft_core::state::FiberState;
use weft_core::{wdebug, winfo};

/// What a queued task runs: a suspended fiber, or a callback that will be
/// run on a recycled per-worker fiber.
pub enum TaskKind {
    Fiber(Arc<Fiber>),
    Callback(Box<dyn FnOnce() + Send>),
}

/// Scheduler queue element.
pub struct Task {
    pub kind: TaskKind,
    /// `Some(w)`: only worker `w` may run it, never stolen.
    /// `None`: any worker.
    pub affinity: Option<usize>,
}

impl Task {
    pub fn fiber(f: Arc<Fiber>, affinity: Option<usize>) -> Task {
        Task {
            kind: TaskKind::Fiber(f),
            affinity,
        }
    }

    pub fn callback<F: FnOnce() + Send + 'static>(f: F, affinity: Option<usize>) -> Task {
        Task {
            kind: TaskKind::Callback(Box::new(f)),
            affinity,
        }
    }
}

/// Pluggable idle/wake strategy. The reactor implements this; the base
/// scheduler uses the defaults.
pub trait Driver: Send + Sync {
    /// Wake one idle worker. No-op in the base scheduler.
    fn tickle(&self, _sched: &Scheduler) {}

    /// Body of the per-worker idle fiber. Must return once the scheduler
    /// can stop; yields between checks otherwise.
    fn idle(&self, sched: &Scheduler) {
        while !self.stopping(sched) {
            Fiber::current().yield_ready();
        }
    }

    /// Per-worker-thread setup before the dispatch loop runs.
    fn on_worker_start(&self, _sched: &Scheduler) {}

    /// Full stop predicate; extensions add their own pending work.
    fn stopping(&self, sched: &Scheduler) -> bool {
        sched.base_stopping()
    }
}

struct NullDriver;
impl Driver for NullDriver {}

fn null_driver() -> Arc<dyn Driver> {
    static NULL: OnceLock<Arc<dyn Driver>> = OnceLock::new();
    NULL.get_or_init(|| Arc::new(NullDriver)).clone()
}

/// Shared per-worker record. The private queue itself lives in the
/// worker's TLS; only its length is mirrored here so the stopping
/// predicate can see it.
struct WorkerShared {
    public: Mutex<VecDeque<Task>>,
    private_len: AtomicUsize,
}

thread_local! {
    static PRIVATE_QUEUE: RefCell<VecDeque<Task>> = const { RefCell::new(VecDeque::new()) };
}

/// The worker pool and its queues.
pub struct Scheduler {
    name: String,
    worker_count: usize,
    use_caller: bool,
    config: RuntimeConfig,
    contexts: Vec<WorkerShared>,
    threads: Mutex<Vec<Thread>>,
    caller_dispatch: Mutex<Option<Arc<Fiber>>>,
    caller_thread: Mutex<Option<std::thread::ThreadId>>,
    driver: RwLock<Option<Weak<dyn Driver>>>,
    started: AtomicBool,
    stopping: AtomicBool,
    active_workers: AtomicUsize,
    idle_workers: AtomicUsize,
    rr_next: AtomicUsize,
}

impl Scheduler {
    /// Create a scheduler with `worker_count` workers. With `use_caller`
    /// the constructing thread counts toward that number and is drafted
    /// as the last worker when `stop` drains.
    pub fn new(
        worker_count: usize,
        use_caller: bool,
        name: &str,
        config: RuntimeConfig,
    ) -> Arc<Scheduler> {
        assert!(worker_count > 0, "scheduler needs at least one worker");
        weft_core::log::init();
        let contexts = (0..worker_count)
            .map(|_| WorkerShared {
                public: Mutex::new(VecDeque::new()),
                private_len: AtomicUsize::new(0),
            })
            .collect();
        Arc::new(Scheduler {
            name: name.to_string(),
            worker_count,
            use_caller,
            config,
            contexts,
            threads: Mutex::new(Vec::new()),
            caller_dispatch: Mutex::new(None),
            caller_thread: Mutex::new(None),
            driver: RwLock::new(None),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            rr_next: AtomicUsize::new(0),
        })
    }

    /// Install the idle/wake driver. Must happen before `start`.
    pub fn set_driver(&self, d: Weak<dyn Driver>) {
        *self.driver.write().unwrap() = Some(d);
    }

    pub(crate) fn driver(&self) -> Arc<dyn Driver> {
        if let Some(w) = self.driver.read().unwrap().as_ref() {
            if let Some(d) = w.upgrade() {
                return d;
            }
        }
        null_driver()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[inline]
    pub fn has_idle_workers(&self) -> bool {
        self.idle_workers.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Spawn the worker threads (all but the caller, which joins the pool
    /// lazily at `stop`).
    pub fn start(self: &Arc<Scheduler>) -> SchedResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SchedError::AlreadyStarted);
        }
        *self.caller_thread.lock().unwrap() = Some(std::thread::current().id());
        let spawned = self.worker_count - usize::from(self.use_caller);
        winfo!(
            "scheduler {}: starting ({} spawned workers, use_caller={})",
            self.name,
            spawned,
            self.use_caller
        );
        for i in 0..spawned {
            let me = self.clone();
            let t = Thread::spawn(&format!("{}-{}", self.name, i), self.pin_core(i), move || {
                me.run_worker(i)
            })?;
            self.threads.lock().unwrap().push(t);
        }
        if self.use_caller {
            let cid = self.worker_count - 1;
            if let Some(core) = self.pin_core(spawned) {
                thread::pin_current_thread(core);
            }
            tls::set_worker_id(cid);
            tls::set_current_scheduler(Some(self.clone()));
            Fiber::ensure_root();
            let me = self.clone();
            let dispatch = Fiber::new(move || me.run_worker(cid), self.config.stack_size, false)?;
            *self.caller_dispatch.lock().unwrap() = Some(dispatch);
        }
        Ok(())
    }

    /// Graceful shutdown: waits until every queued task has run and every
    /// worker has exited. With caller participation, must be called from
    /// the constructing thread, which drains alongside the pool.
    pub fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        winfo!("scheduler {}: stop requested", self.name);
        self.stopping.store(true, Ordering::SeqCst);
        for _ in 0..self.worker_count {
            self.driver().tickle(self);
        }
        let caller_fiber = self.caller_dispatch.lock().unwrap().take();
        if self.use_caller {
            let expected = self.caller_thread.lock().unwrap().expect("scheduler started");
            assert_eq!(
                std::thread::current().id(),
                expected,
                "stop must be called from the caller thread when use_caller is set"
            );
            self.driver().tickle(self);
            if let Some(df) = caller_fiber {
                if !self.driver().stopping(self) {
                    df.resume();
                }
            }
        }
        let threads: Vec<Thread> = std::mem::take(&mut *self.threads.lock().unwrap());
        for t in threads {
            t.join();
        }
        winfo!("scheduler {}: stopped", self.name);
    }

    /// Route a task to a worker queue. Never blocks.
    ///
    /// Affinity-pinned tasks go to the named worker's public queue. A
    /// no-affinity fiber task posted from inside this scheduler's own
    /// dispatch loop stays on the posting worker's private queue with no
    /// lock and no wake; everything else round-robins into a public queue
    /// and issues exactly one wake.
    pub fn schedule(&self, task: Task) {
        if let TaskKind::Fiber(f) = &task.kind {
            if f.state() == FiberState::Waiting {
                f.set_state(FiberState::Ready);
            }
        }
        match task.affinity {
            Some(w) => {
                assert!(
                    w < self.worker_count,
                    "schedule: worker {} out of range (have {})",
                    w,
                    self.worker_count
                );
                self.contexts[w].public.lock().unwrap().push_back(task);
                self.driver().tickle(self);
            }
            None => {
                if matches!(task.kind, TaskKind::Fiber(_)) && self.on_own_worker() {
                    let wid = tls::worker_id();
                    PRIVATE_QUEUE.with(|q| q.borrow_mut().push_back(task));
                    self.contexts[wid].private_len.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                let w = self.rr_next.fetch_add(1, Ordering::Relaxed) % self.worker_count;
                self.contexts[w].public.lock().unwrap().push_back(task);
                self.driver().tickle(self);
            }
        }
    }

    /// Schedule a suspended fiber.
    pub fn schedule_fiber(&self, f: Arc<Fiber>, affinity: Option<usize>) {
        self.schedule(Task::fiber(f, affinity));
    }

    /// Schedule a callback.
    pub fn schedule_callback<F: FnOnce() + Send + 'static>(&self, f: F, affinity: Option<usize>) {
        self.schedule(Task::callback(f, affinity));
    }

    /// Stopping is requested, nothing queued anywhere, nobody mid-task.
    pub fn base_stopping(&self) -> bool {
        self.is_stopping()
            && self.active_workers.load(Ordering::SeqCst) == 0
            && self.all_queues_empty()
    }

    fn all_queues_empty(&self) -> bool {
        self.contexts.iter().all(|c| {
            c.private_len.load(Ordering::Acquire) == 0 && c.public.lock().unwrap().is_empty()
        })
    }

    /// Whether the calling thread is inside this scheduler's dispatch
    /// loop (worker id assigned and dispatch fiber installed).
    fn on_own_worker(&self) -> bool {
        if tls::worker_id() == usize::MAX || tls::dispatch_fiber().is_none() {
            return false;
        }
        tls::current_scheduler()
            .map(|s| std::ptr::eq(Arc::as_ptr(&s), self))
            .unwrap_or(false)
    }

    fn pin_core(&self, i: usize) -> Option<usize> {
        if !self.config.pin_cpu {
            return None;
        }
        Some((self.config.pin_offset + i * self.config.pin_stride) % thread::num_cores())
    }

    /// Dispatch loop, one per worker thread (the caller runs it inside
    /// its dispatch fiber during `stop`).
    fn run_worker(self: &Arc<Scheduler>, wid: usize) {
        tls::set_worker_id(wid);
        tls::set_current_scheduler(Some(self.clone()));
        // For spawned workers the dispatch context is the thread root;
        // for the caller it is the dedicated dispatch fiber we are
        // currently running on.
        tls::set_dispatch_fiber(Some(Fiber::current()));
        let driver = self.driver();
        driver.on_worker_start(self);
        wdebug!("scheduler {}: worker {} up", self.name, wid);

        let me = self.clone();
        let idle = Fiber::new(
            move || {
                let d = me.driver();
                d.idle(&me);
            },
            self.config.stack_size,
            true,
        )
        .expect("idle fiber allocation failed");
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            // take_task marks this worker active before it lets go of the
            // queue, so the stopping predicate cannot observe "all empty,
            // nobody active" while a task is in flight.
            if let Some(task) = self.take_task(wid) {
                self.run_task(wid, task, &mut cb_fiber);
                self.active_workers.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
            if idle.state().is_done() {
                wdebug!("scheduler {}: worker {} idle fiber done, exiting", self.name, wid);
                break;
            }
            self.idle_workers.fetch_add(1, Ordering::SeqCst);
            idle.resume();
            self.idle_workers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Next task for worker `wid`: private queue first, then own public
    /// queue (entries pinned to another worker are left in place), then
    /// stealing an affinity-free task from another public queue.
    ///
    /// The worker is counted active before the queue is released; the
    /// matching decrement happens in the dispatch loop after the task
    /// ran.
    fn take_task(&self, wid: usize) -> Option<Task> {
        if let Some(task) = PRIVATE_QUEUE.with(|q| q.borrow_mut().pop_front()) {
            self.active_workers.fetch_add(1, Ordering::SeqCst);
            self.contexts[wid].private_len.fetch_sub(1, Ordering::Relaxed);
            return Some(task);
        }

        let mut skipped_foreign = false;
        let picked = {
            let mut q = self.contexts[wid].public.lock().unwrap();
            let mut idx = None;
            for (i, t) in q.iter().enumerate() {
                match t.affinity {
                    Some(w) if w != wid => skipped_foreign = true,
                    _ => {
                        idx = Some(i);
                        break;
                    }
                }
            }
            let picked = idx.and_then(|i| q.remove(i));
            if picked.is_some() {
                self.active_workers.fetch_add(1, Ordering::SeqCst);
            }
            picked
        };
        if skipped_foreign {
            // Someone else's pinned work is sitting visible; remind them.
            self.driver().tickle(self);
        }
        if picked.is_some() {
            return picked;
        }

        for j in 0..self.worker_count {
            if j == wid {
                continue;
            }
            let mut q = self.contexts[j].public.lock().unwrap();
            if let Some(i) = q.iter().position(|t| t.affinity.is_none()) {
                let t = q.remove(i);
                if t.is_some() {
                    self.active_workers.fetch_add(1, Ordering::SeqCst);
                }
                return t;
            }
        }
        None
    }

    fn requeue_private(&self, wid: usize, task: Task) {
        PRIVATE_QUEUE.with(|q| q.borrow_mut().push_back(task));
        self.contexts[wid].private_len.fetch_add(1, Ordering::Relaxed);
    }

    fn run_task(&self, wid: usize, task: Task, cb_fiber: &mut Option<Arc<Fiber>>) {
        match task.kind {
            TaskKind::Fiber(f) => {
                let state = f.state();
                if state.is_done() {
                    return;
                }
                if state == FiberState::Running {
                    // Still mid-switch on another worker; revisit.
                    self.contexts[wid]
                        .public
                        .lock()
                        .unwrap()
                        .push_back(Task::fiber(f, None));
                    return;
                }
                if state == FiberState::Waiting {
                    f.set_state(FiberState::Ready);
                }
                f.resume();
                if f.state() == FiberState::Ready {
                    // Cooperative yield: back on this worker's private queue
                    self.requeue_private(wid, Task::fiber(f, None));
                }
            }
            TaskKind::Callback(cb) => {
                let fiber = match cb_fiber.take() {
                    Some(f) => {
                        f.reset(cb);
                        f
                    }
                    None => Fiber::new_boxed(cb, self.config.stack_size, true)
                        .expect("cb fiber allocation failed"),
                };
                fiber.resume();
                match fiber.state() {
                    FiberState::Ready => self.requeue_private(wid, Task::fiber(fiber, None)),
                    s if s.is_done() => *cb_fiber = Some(fiber),
                    // Waiting: parked on the reactor, its waker owns it now
                    _ => {}
                }
            }
        }
    }
}

/// Yield the current fiber back to its dispatcher, which requeues it. On
/// a plain thread (or the root fiber) this yields the OS thread instead.
pub fn yield_now() {
    if let Some(cur) = tls::current_fiber() {
        if !cur.is_root() {
            cur.yield_ready();
            return;
        }
    }
    std::thread::yield_now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn test_config() -> RuntimeConfig {
        RuntimeConfig::new().stack_size(64 * 1024)
    }

    fn wait_for(pred: impl Fn() -> bool, ms: u64) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_millis(ms) {
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        pred()
    }

    #[test]
    fn test_callbacks_run_and_stop_drains() {
        let sched = Scheduler::new(2, false, "sched-test", test_config());
        sched.start().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let h = hits.clone();
            sched.schedule_callback(
                move || {
                    h.fetch_add(1, Ordering::SeqCst);
                },
                None,
            );
        }
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_fiber_task_runs() {
        let sched = Scheduler::new(1, false, "sched-fiber", test_config());
        sched.start().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let f = Fiber::new(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
                crate::scheduler::yield_now();
                h.fetch_add(1, Ordering::SeqCst);
            },
            64 * 1024,
            true,
        )
        .unwrap();
        sched.schedule_fiber(f, None);
        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 2, 2000));
        sched.stop();
    }

    #[test]
    fn test_affinity_lands_on_named_worker() {
        let sched = Scheduler::new(3, false, "sched-aff", test_config());
        sched.start().unwrap();
        let wrong = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let w = wrong.clone();
            let d = done.clone();
            sched.schedule_callback(
                move || {
                    if tls::worker_id() != 1 {
                        w.fetch_add(1, Ordering::SeqCst);
                    }
                    d.fetch_add(1, Ordering::SeqCst);
                },
                Some(1),
            );
        }
        assert!(wait_for(|| done.load(Ordering::SeqCst) == 50, 2000));
        sched.stop();
        assert_eq!(wrong.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_use_caller_drains_at_stop() {
        let sched = Scheduler::new(2, true, "sched-caller", test_config());
        sched.start().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let h = hits.clone();
            sched.schedule_callback(
                move || {
                    h.fetch_add(1, Ordering::SeqCst);
                },
                None,
            );
        }
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_double_start_rejected() {
        let sched = Scheduler::new(1, false, "sched-twice", test_config());
        sched.start().unwrap();
        assert!(matches!(sched.start(), Err(SchedError::AlreadyStarted)));
        sched.stop();
    }
}
