//! Echo server under load: an accept fiber spawning one handler fiber
//! per connection, all written as blocking read/write, driven by plain
//! std::net clients on OS threads.
//!
//! Single test in this file on purpose: it compares /proc/self/fd
//! before and after to catch descriptor leaks.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use weft::{spawn, IoManager, Listener, RuntimeConfig};

const CLIENTS: usize = 16;
const BYTES_PER_CLIENT: usize = 128 * 1024;
const CHUNK: usize = 4096;

fn open_fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

#[test]
fn echo_under_load() {
    let fds_before = open_fd_count();
    {
        let iom = IoManager::new(
            4,
            false,
            "echo-test",
            RuntimeConfig::new().stack_size(64 * 1024).idle_block_ms(200),
        )
        .unwrap();

        let handlers_now = Arc::new(AtomicUsize::new(0));
        let handlers_peak = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let accept_done = Arc::new(AtomicBool::new(false));
        let (port_tx, port_rx) = mpsc::channel::<u16>();

        {
            let iom2 = iom.clone();
            let now = handlers_now.clone();
            let peak = handlers_peak.clone();
            let stop = stop.clone();
            let accept_done = accept_done.clone();
            spawn(&iom, move || {
                let listener =
                    Listener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
                port_tx.send(listener.local_addr().unwrap().port()).unwrap();
                loop {
                    match listener.accept() {
                        Ok(stream) => {
                            if stop.load(Ordering::SeqCst) {
                                break;
                            }
                            let count = now.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(count, Ordering::SeqCst);
                            let now = now.clone();
                            let _ = spawn(&iom2, move || {
                                let mut buf = [0u8; CHUNK];
                                loop {
                                    let n = stream.read(&mut buf);
                                    if n <= 0 {
                                        break;
                                    }
                                    if stream.write_all(&buf[..n as usize]) < 0 {
                                        break;
                                    }
                                }
                                now.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                        Err(_) => break,
                    }
                }
                accept_done.store(true, Ordering::SeqCst);
            })
            .unwrap();
        }

        let port = port_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);

        // Clients: ping-pong 4 KiB chunks and verify every echoed byte
        let mut clients = Vec::new();
        for c in 0..CLIENTS {
            clients.push(std::thread::spawn(move || {
                let mut conn = TcpStream::connect(addr).unwrap();
                let mut chunk = [0u8; CHUNK];
                let mut back = [0u8; CHUNK];
                let mut sent = 0usize;
                while sent < BYTES_PER_CLIENT {
                    for (i, b) in chunk.iter_mut().enumerate() {
                        *b = ((sent + i + c) & 0xFF) as u8;
                    }
                    conn.write_all(&chunk).unwrap();
                    conn.read_exact(&mut back).unwrap();
                    assert_eq!(chunk, back, "client {} echo mismatch at {}", c, sent);
                    sent += CHUNK;
                }
            }));
        }
        for c in clients {
            c.join().unwrap();
        }

        // All handlers wind down once their peers disconnect
        let start = Instant::now();
        while handlers_now.load(Ordering::SeqCst) != 0 {
            assert!(
                start.elapsed() < Duration::from_secs(5),
                "{} handlers still alive",
                handlers_now.load(Ordering::SeqCst)
            );
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(handlers_peak.load(Ordering::SeqCst) <= CLIENTS);

        // Unpark the accept fiber with a sentinel connection so stop()
        // has nothing pending to wait on
        stop.store(true, Ordering::SeqCst);
        let _ = TcpStream::connect(addr).unwrap();
        let start = Instant::now();
        while !accept_done.load(Ordering::SeqCst) {
            assert!(start.elapsed() < Duration::from_secs(5), "accept fiber stuck");
            std::thread::sleep(Duration::from_millis(5));
        }

        iom.stop();
    }
    // Runtime dropped: epoll, self-pipe, listener and every connection
    // are closed again
    let start = Instant::now();
    while open_fd_count() != fds_before {
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "fd leak: {} open before, {} after",
            fds_before,
            open_fd_count()
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}
