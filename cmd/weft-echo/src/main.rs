//! Weft echo server
//!
//! TCP echo server on the fiber runtime: one accept fiber, one handler
//! fiber per connection, each written as plain blocking read/write.
//!
//! Usage:
//!     cargo run --release -p weft-echo [port]
//!
//! Test with:
//!     echo "hello" | nc localhost 9900
//!
//! Environment: WEFT_NUM_WORKERS, WEFT_LOG_LEVEL and the other WEFT_*
//! knobs apply.

use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use weft::{spawn, winfo, IoManager, Listener, RuntimeConfig};

static CONNS: AtomicU64 = AtomicU64::new(0);

fn handle(stream: weft::Stream, id: u64) {
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf);
        if n <= 0 {
            break;
        }
        if stream.write_all(&buf[..n as usize]) < 0 {
            break;
        }
    }
    winfo!("conn {}: closed ({} open)", id, CONNS.fetch_sub(1, Ordering::Relaxed) - 1);
}

fn main() -> Result<()> {
    let port: u16 = std::env::args()
        .nth(1)
        .map(|s| s.parse())
        .transpose()
        .context("port must be a number")?
        .unwrap_or(9900);

    let config = RuntimeConfig::from_env();
    config.validate().context("bad WEFT_* configuration")?;
    let workers = config.num_workers;
    let iom = IoManager::new(workers, true, "weft-echo", config)
        .context("failed to start the runtime")?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    spawn(&iom, move || {
        let listener = match Listener::bind(addr) {
            Ok(l) => l,
            Err(e) => {
                weft::werror!("bind {} failed: errno {}", addr, e);
                return;
            }
        };
        winfo!("listening on {}", addr);
        let iom = IoManager::current().expect("accept fiber runs on the reactor");
        loop {
            match listener.accept() {
                Ok(stream) => {
                    let id = CONNS.fetch_add(1, Ordering::Relaxed) + 1;
                    winfo!("conn {}: accepted fd {}", id, stream.fd());
                    let _ = spawn(&iom, move || handle(stream, id));
                }
                Err(e) => {
                    weft::werror!("accept failed: errno {}", e);
                    break;
                }
            }
        }
    })?;

    // The caller thread joins the worker pool and serves until killed;
    // the accept fiber keeps the reactor busy, so this never returns
    // while the listener lives.
    iom.stop();
    Ok(())
}
