//! Hooked sleep: concurrent fibers sleep in parallel on a small pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use weft::{sleep_ms, spawn, IoManager, RuntimeConfig};

/// 100 fibers sleeping 50 ms on 2 workers all finish in roughly one
/// sleep period: the sleeps overlap instead of serializing, and the
/// workers block in the reactor instead of spinning.
#[test]
fn hundred_sleepers_finish_together() {
    let iom = IoManager::new(
        2,
        false,
        "sleep-test",
        RuntimeConfig::new().stack_size(64 * 1024).idle_block_ms(200),
    )
    .unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    for _ in 0..100 {
        let d = done.clone();
        spawn(&iom, move || {
            sleep_ms(50);
            d.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    }

    while done.load(Ordering::Relaxed) < 100 {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "only {} of 100 sleepers finished",
            done.load(Ordering::Relaxed)
        );
        std::thread::sleep(Duration::from_millis(2));
    }
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(45),
        "sleeps returned early: {:?}",
        elapsed
    );
    assert!(
        elapsed < Duration::from_millis(1000),
        "sleeps serialized: {:?} for 100 x 50ms on 2 workers",
        elapsed
    );
    iom.stop();
}

/// sleep_ms off the runtime falls back to a plain thread sleep.
#[test]
fn sleep_off_runtime_blocks_thread() {
    let start = Instant::now();
    sleep_ms(30);
    assert!(start.elapsed() >= Duration::from_millis(25));
}
