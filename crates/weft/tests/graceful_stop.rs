//! Graceful shutdown: stop() returns only after all queued work ran.
//!
//! Single test in this file on purpose: the fiber-leak assertion needs a
//! process where nothing else is spawning fibers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use weft::{sleep_ms, spawn, Fiber, IoManager, RuntimeConfig};

#[test]
fn stop_drains_everything() {
    let iom = IoManager::new(
        2,
        false,
        "stop-test",
        RuntimeConfig::new().stack_size(64 * 1024).idle_block_ms(200),
    )
    .unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..200 {
        let d = done.clone();
        spawn(&iom, move || {
            sleep_ms(10);
            d.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    }

    // Immediately: stop must wait for all 200, sleeps included
    iom.stop();
    assert_eq!(done.load(Ordering::Relaxed), 200, "stop dropped tasks");
    assert_eq!(iom.pending_events(), 0);

    // Workers are joined, their roots and idle fibers are gone, every
    // spawned fiber terminated and was dropped
    assert_eq!(Fiber::live_count(), 0, "fibers leaked across stop");
}
