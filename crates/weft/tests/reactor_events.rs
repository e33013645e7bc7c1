//! Reactor event arming, cancellation and close propagation.

use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use weft::{hook, spawn, IoEvent, IoManager, Listener, RuntimeConfig};

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

/// add_event then cancel_event restores the fd mask, runs the waiter
/// exactly once, and leaves the pending gauge where it started.
#[test]
fn add_then_cancel_fires_once() {
    let iom = IoManager::new(1, false, "cancel-test", config()).unwrap();
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    assert!(fd >= 0);

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    assert_eq!(iom.pending_events(), 0);
    iom.add_event(
        fd,
        IoEvent::Read,
        Some(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();
    assert_eq!(iom.pending_events(), 1);

    assert!(iom.cancel_event(fd, IoEvent::Read));
    assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1, 2_000));
    assert_eq!(iom.pending_events(), 0);

    // Idempotent: the event is gone
    assert!(!iom.cancel_event(fd, IoEvent::Read));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    unsafe { libc::close(fd) };
    iom.stop();
}

/// del_event removes silently: the waiter never runs.
#[test]
fn del_event_is_silent() {
    let iom = IoManager::new(1, false, "del-test", config()).unwrap();
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    iom.add_event(
        fd,
        IoEvent::Read,
        Some(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();
    assert!(iom.del_event(fd, IoEvent::Read));
    assert_eq!(iom.pending_events(), 0);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 0, "del_event ran the waiter");

    assert!(!iom.del_event(fd, IoEvent::Read));
    unsafe { libc::close(fd) };
    iom.stop();
}

/// A reader parked on a connection resumes with EBADF when the fd is
/// closed under it.
#[test]
fn close_wakes_parked_reader() {
    let iom = IoManager::new(2, false, "close-test", config()).unwrap();

    let (port_tx, port_rx) = mpsc::channel::<u16>();
    let (fd_tx, fd_rx) = mpsc::channel::<i32>();
    let read_result = Arc::new(AtomicIsize::new(isize::MIN));

    {
        let r = read_result.clone();
        spawn(&iom, move || {
            let listener = Listener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
            port_tx.send(listener.local_addr().unwrap().port()).unwrap();
            let stream = listener.accept().unwrap();
            fd_tx.send(stream.fd()).unwrap();
            // No data ever arrives; only the close can end this read
            let mut buf = [0u8; 16];
            let n = hook::read(stream.fd(), &mut buf);
            let e = if n < 0 {
                unsafe { *libc::__errno_location() }
            } else {
                0
            };
            r.store(if n < 0 { -(e as isize) } else { n }, Ordering::SeqCst);
            // The fd is already gone; keep Drop from double-closing
            std::mem::forget(stream);
        })
        .unwrap();
    }

    let port = port_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let _client = TcpStream::connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).unwrap();
    let fd = fd_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Let the reader park, then close its fd on a worker
    std::thread::sleep(Duration::from_millis(50));
    iom.schedule_callback(
        move || {
            hook::close(fd);
        },
        None,
    );

    assert!(
        wait_for(|| read_result.load(Ordering::SeqCst) != isize::MIN, 5_000),
        "parked reader never woke"
    );
    let got = read_result.load(Ordering::SeqCst);
    assert_eq!(
        got,
        -(libc::EBADF as isize),
        "expected EBADF, got {}",
        got
    );
    iom.stop();
}
