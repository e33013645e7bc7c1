//! Scheduler behavior under load: stealing, affinity, cooperative yield.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use weft::{sleep_ms, spawn, spawn_pinned, tls, IoManager, RuntimeConfig};

fn config() -> RuntimeConfig {
    RuntimeConfig::new().stack_size(64 * 1024).idle_block_ms(200)
}

fn wait_for(pred: impl Fn() -> bool, ms: u64) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(ms) {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    pred()
}

/// Affinity-free callbacks posted from one worker spread over the whole
/// pool: every worker ends up executing a healthy share.
#[test]
fn steal_fairness() {
    const WORKERS: usize = 4;
    const TASKS: usize = 4000;
    let iom = IoManager::new(WORKERS, false, "steal-test", config()).unwrap();

    let per_worker: Arc<Vec<AtomicUsize>> =
        Arc::new((0..WORKERS).map(|_| AtomicUsize::new(0)).collect());
    let done = Arc::new(AtomicUsize::new(0));

    // Post everything from worker 0 so distribution is the scheduler's
    // doing, not the test's
    let iom2 = iom.clone();
    let pw = per_worker.clone();
    let d = done.clone();
    spawn_pinned(&iom, 0, move || {
        for _ in 0..TASKS {
            let pw = pw.clone();
            let d = d.clone();
            iom2.schedule_callback(
                move || {
                    let w = tls::worker_id();
                    pw[w].fetch_add(1, Ordering::Relaxed);
                    sleep_ms(1);
                    d.fetch_add(1, Ordering::Relaxed);
                },
                None,
            );
        }
    })
    .unwrap();

    assert!(
        wait_for(|| done.load(Ordering::Relaxed) == TASKS, 30_000),
        "only {} of {} tasks finished",
        done.load(Ordering::Relaxed),
        TASKS
    );
    for (w, c) in per_worker.iter().enumerate() {
        let n = c.load(Ordering::Relaxed);
        assert!(
            n >= TASKS / WORKERS / 3,
            "worker {} ran only {} of {} tasks",
            w,
            n,
            TASKS
        );
    }
    iom.stop();
}

/// Callbacks pinned to one worker are never run anywhere else.
#[test]
fn affinity_respected() {
    const WORKERS: usize = 4;
    const TASKS: usize = 2000;
    let iom = IoManager::new(WORKERS, false, "affinity-test", config()).unwrap();

    let on_target = Arc::new(AtomicUsize::new(0));
    let elsewhere = Arc::new(AtomicUsize::new(0));
    for _ in 0..TASKS {
        let t = on_target.clone();
        let e = elsewhere.clone();
        iom.schedule_callback(
            move || {
                if tls::worker_id() == 2 {
                    t.fetch_add(1, Ordering::Relaxed);
                } else {
                    e.fetch_add(1, Ordering::Relaxed);
                }
            },
            Some(2),
        );
    }
    assert!(
        wait_for(
            || on_target.load(Ordering::Relaxed) + elsewhere.load(Ordering::Relaxed) == TASKS,
            15_000
        ),
        "tasks did not drain"
    );
    assert_eq!(elsewhere.load(Ordering::Relaxed), 0, "pinned tasks were stolen");
    assert_eq!(on_target.load(Ordering::Relaxed), TASKS);
    iom.stop();
}

/// Cooperative yield interleaves fibers instead of dropping them.
#[test]
fn yield_interleaves() {
    let iom = IoManager::new(1, false, "yield-test", config()).unwrap();
    let steps = Arc::new(AtomicUsize::new(0));
    let s1 = steps.clone();
    let s2 = steps.clone();
    spawn(&iom, move || {
        for _ in 0..10 {
            s1.fetch_add(1, Ordering::Relaxed);
            weft::yield_now();
        }
    })
    .unwrap();
    spawn(&iom, move || {
        for _ in 0..10 {
            s2.fetch_add(1, Ordering::Relaxed);
            weft::yield_now();
        }
    })
    .unwrap();
    assert!(wait_for(|| steps.load(Ordering::Relaxed) == 20, 5_000));
    iom.stop();
}

/// A panicking fiber is logged and the worker keeps going.
#[test]
fn faulted_fiber_does_not_kill_worker() {
    let iom = IoManager::new(1, false, "fault-test", config()).unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    weft::log::set_level(weft::LogLevel::Off);
    spawn(&iom, || panic!("deliberate fault")).unwrap();
    let d = done.clone();
    spawn(&iom, move || {
        d.fetch_add(1, Ordering::Relaxed);
    })
    .unwrap();
    assert!(wait_for(|| done.load(Ordering::Relaxed) == 1, 5_000));
    iom.stop();
}
