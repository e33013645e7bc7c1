//! Deadline timers
//!
//! An ordered set of absolute monotonic deadlines with O(log n) insert.
//! The reactor reads the gap to the earliest deadline for its epoll
//! timeout and drains expired callbacks after each wake. Inserting a new
//! earliest timer fires a notify hook (the reactor's tickle) so an
//! already-blocking wait re-reads its timeout; a tickled flag suppresses
//! repeat notifications until the next `next_timer_delay` read.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Shared timer callback. Recurring timers invoke it once per period.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Clock regression beyond this is treated as a reset and expires
/// everything, so timers cannot get stuck forever.
const ROLLOVER_THRESHOLD_MS: u64 = 60 * 60 * 1000;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(0);

/// Milliseconds since an arbitrary epoch, unaffected by wall-clock steps.
pub fn elapsed_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1000 + (ts.tv_nsec as u64) / 1_000_000
}

struct TimerInner {
    id: u64,
    recurring: bool,
    /// Only mutated while the timer is out of the set, under the manager
    /// write lock.
    deadline_ms: AtomicU64,
    period_ms: AtomicU64,
    /// None once fired (non-recurring) or cancelled.
    cb: Mutex<Option<TimerCallback>>,
}

/// Set entry ordered by (deadline, id); identity breaks ties so equal
/// deadlines coexist.
struct Entry(Arc<TimerInner>);

impl Entry {
    fn key(&self) -> (u64, u64) {
        (self.0.deadline_ms.load(Ordering::Relaxed), self.0.id)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

/// Handle to a pending timer.
pub struct Timer {
    inner: Arc<TimerInner>,
    mgr: Arc<TimerManager>,
}

impl Timer {
    /// Remove the timer without firing it. Returns false if it already
    /// fired or was cancelled.
    pub fn cancel(&self) -> bool {
        let mut set = self.mgr.timers.write().unwrap();
        let had_cb = self.inner.cb.lock().unwrap().take().is_some();
        if had_cb {
            set.remove(&Entry(self.inner.clone()));
        }
        had_cb
    }

    /// Push the deadline to now + period, keeping the callback.
    pub fn refresh(&self) -> bool {
        let mut set = self.mgr.timers.write().unwrap();
        if self.inner.cb.lock().unwrap().is_none() {
            return false;
        }
        if !set.remove(&Entry(self.inner.clone())) {
            return false;
        }
        self.inner.deadline_ms.store(
            elapsed_ms() + self.inner.period_ms.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        set.insert(Entry(self.inner.clone()));
        true
    }

    /// Change the period. With `from_now` false the original phase is
    /// preserved so jitter does not accumulate.
    pub fn reset(&self, period_ms: u64, from_now: bool) -> bool {
        if period_ms == self.inner.period_ms.load(Ordering::Relaxed) && !from_now {
            return true;
        }
        let at_front;
        {
            let mut set = self.mgr.timers.write().unwrap();
            if self.inner.cb.lock().unwrap().is_none() {
                return false;
            }
            if !set.remove(&Entry(self.inner.clone())) {
                return false;
            }
            let start = if from_now {
                elapsed_ms()
            } else {
                self.inner
                    .deadline_ms
                    .load(Ordering::Relaxed)
                    .saturating_sub(self.inner.period_ms.load(Ordering::Relaxed))
            };
            self.inner.period_ms.store(period_ms, Ordering::Relaxed);
            self.inner
                .deadline_ms
                .store(start + period_ms, Ordering::Relaxed);
            at_front = self.mgr.insert_locked(&mut set, self.inner.clone());
        }
        if at_front {
            self.mgr.notify_front();
        }
        true
    }
}

/// Ordered set of pending timers.
pub struct TimerManager {
    timers: RwLock<BTreeSet<Entry>>,
    tickled: AtomicBool,
    previous_ms: AtomicU64,
    notify: RwLock<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl TimerManager {
    pub fn new() -> Arc<TimerManager> {
        Arc::new(TimerManager {
            timers: RwLock::new(BTreeSet::new()),
            tickled: AtomicBool::new(false),
            previous_ms: AtomicU64::new(elapsed_ms()),
            notify: RwLock::new(None),
        })
    }

    /// Install the hook run when a new earliest timer is inserted.
    pub fn set_notify(&self, f: Box<dyn Fn() + Send + Sync>) {
        *self.notify.write().unwrap() = Some(f);
    }

    /// Schedule `cb` to fire `period_ms` from now; recurring timers
    /// re-arm themselves on expiry.
    pub fn add_timer(
        self: &Arc<Self>,
        period_ms: u64,
        cb: TimerCallback,
        recurring: bool,
    ) -> Timer {
        let inner = Arc::new(TimerInner {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            recurring,
            deadline_ms: AtomicU64::new(elapsed_ms() + period_ms),
            period_ms: AtomicU64::new(period_ms),
            cb: Mutex::new(Some(cb)),
        });
        let at_front = {
            let mut set = self.timers.write().unwrap();
            self.insert_locked(&mut set, inner.clone())
        };
        if at_front {
            self.notify_front();
        }
        Timer {
            inner,
            mgr: self.clone(),
        }
    }

    /// As `add_timer`, but the callback only runs if `cond` is still
    /// alive at expiry. Keeps deadlines from pinning their targets.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        self: &Arc<Self>,
        period_ms: u64,
        cb: TimerCallback,
        cond: Weak<T>,
    ) -> Timer {
        let wrapped: TimerCallback = Arc::new(move || {
            if cond.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer(period_ms, wrapped, false)
    }

    /// Gap to the earliest deadline: `Some(0)` when already due, `None`
    /// when no timers are pending. Re-arms front notification.
    pub fn next_timer_delay(&self) -> Option<u64> {
        self.tickled.store(false, Ordering::Relaxed);
        let set = self.timers.read().unwrap();
        let first = set.first()?;
        let deadline = first.0.deadline_ms.load(Ordering::Relaxed);
        Some(deadline.saturating_sub(elapsed_ms()))
    }

    pub fn has_timer(&self) -> bool {
        !self.timers.read().unwrap().is_empty()
    }

    /// Collect the callbacks of every expired timer, removing them from
    /// the set and re-arming recurring ones. Detects monotonic clock
    /// regression (more than one hour backwards) and then expires
    /// everything.
    pub fn list_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = elapsed_ms();
        let mut set = self.timers.write().unwrap();
        if set.is_empty() {
            return;
        }
        let prev = self.previous_ms.swap(now, Ordering::Relaxed);
        let rollover = now < prev && prev - now > ROLLOVER_THRESHOLD_MS;

        loop {
            let due = match set.first() {
                Some(e) => rollover || e.0.deadline_ms.load(Ordering::Relaxed) <= now,
                None => false,
            };
            if !due {
                break;
            }
            let entry = set.pop_first().unwrap();
            let inner = entry.0;
            let cb = {
                let mut guard = inner.cb.lock().unwrap();
                if inner.recurring {
                    guard.clone()
                } else {
                    guard.take()
                }
            };
            if let Some(cb) = cb {
                if inner.recurring {
                    inner
                        .deadline_ms
                        .store(now + inner.period_ms.load(Ordering::Relaxed), Ordering::Relaxed);
                    set.insert(Entry(inner));
                }
                out.push(cb);
            }
        }
    }

    /// Insert under an already-held write lock; returns whether the new
    /// timer became the earliest and notification is due.
    fn insert_locked(&self, set: &mut BTreeSet<Entry>, inner: Arc<TimerInner>) -> bool {
        set.insert(Entry(inner.clone()));
        let is_first = set
            .first()
            .map(|e| Arc::ptr_eq(&e.0, &inner))
            .unwrap_or(false);
        if is_first {
            !self.tickled.swap(true, Ordering::Relaxed)
        } else {
            false
        }
    }

    fn notify_front(&self) {
        if let Some(f) = self.notify.read().unwrap().as_ref() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_cb(n: &Arc<AtomicUsize>) -> TimerCallback {
        let n = n.clone();
        Arc::new(move || {
            n.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_due_timer_expires_once() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        mgr.add_timer(0, counter_cb(&hits), false);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let mut cbs = Vec::new();
        mgr.list_expired(&mut cbs);
        assert_eq!(cbs.len(), 1);
        for cb in &cbs {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_cancel_never_fires() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let t = mgr.add_timer(0, counter_cb(&hits), false);
        assert!(t.cancel());
        assert!(!t.cancel());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let mut cbs = Vec::new();
        mgr.list_expired(&mut cbs);
        assert!(cbs.is_empty());
    }

    #[test]
    fn test_recurring_rearms() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let t = mgr.add_timer(1, counter_cb(&hits), true);
        std::thread::sleep(std::time::Duration::from_millis(3));
        let mut cbs = Vec::new();
        mgr.list_expired(&mut cbs);
        assert_eq!(cbs.len(), 1);
        assert!(mgr.has_timer(), "recurring timer re-armed");
        t.cancel();
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_equal_deadlines_coexist() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        mgr.add_timer(1000, counter_cb(&hits), false);
        mgr.add_timer(1000, counter_cb(&hits), false);
        assert_eq!(mgr.timers.read().unwrap().len(), 2);
    }

    #[test]
    fn test_next_delay_shapes() {
        let mgr = TimerManager::new();
        assert!(mgr.next_timer_delay().is_none());
        mgr.add_timer(5_000, Arc::new(|| {}), false);
        let d = mgr.next_timer_delay().unwrap();
        assert!(d > 4_000 && d <= 5_000);
    }

    #[test]
    fn test_condition_timer_skips_dead_cond() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let cond = Arc::new(());
        mgr.add_condition_timer(0, counter_cb(&hits), Arc::downgrade(&cond));
        drop(cond);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let mut cbs = Vec::new();
        mgr.list_expired(&mut cbs);
        for cb in &cbs {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0, "dead condition suppressed the callback");
    }

    #[test]
    fn test_notify_fires_for_new_front() {
        let mgr = TimerManager::new();
        let notifies = Arc::new(AtomicUsize::new(0));
        let n = notifies.clone();
        mgr.set_notify(Box::new(move || {
            n.fetch_add(1, Ordering::SeqCst);
        }));
        mgr.add_timer(1000, Arc::new(|| {}), false);
        assert_eq!(notifies.load(Ordering::SeqCst), 1);
        // A later timer is not at the front: no notify
        mgr.add_timer(5000, Arc::new(|| {}), false);
        assert_eq!(notifies.load(Ordering::SeqCst), 1);
        // Earlier, but tickled flag suppresses until next delay read
        mgr.add_timer(10, Arc::new(|| {}), false);
        assert_eq!(notifies.load(Ordering::SeqCst), 1);
        let _ = mgr.next_timer_delay();
        mgr.add_timer(1, Arc::new(|| {}), false);
        assert_eq!(notifies.load(Ordering::SeqCst), 2);
    }
}
