//! Worker thread management
//!
//! Thin wrapper over `std::thread` that names the thread, optionally pins
//! it to a CPU, and blocks the spawner until the new thread has finished
//! its setup, so worker state is deterministic once `spawn` returns.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use weft_core::error::{SchedError, SchedResult};
use weft_core::wwarn;

/// A named, optionally CPU-pinned OS thread.
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl Thread {
    /// Spawn a thread running `f`. Returns once the thread is up and, if
    /// requested, pinned.
    pub fn spawn<F>(name: &str, cpu: Option<usize>, f: F) -> SchedResult<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<()>();
        let tname = name.to_string();
        let handle = thread::Builder::new()
            .name(tname.clone())
            .spawn(move || {
                if let Some(core) = cpu {
                    pin_current_thread(core);
                }
                // Startup barrier: the spawner waits for this
                let _ = tx.send(());
                f();
            })
            .map_err(|_| SchedError::SpawnFailed)?;
        rx.recv().map_err(|_| SchedError::SpawnFailed)?;
        Ok(Thread {
            handle: Some(handle),
            name: tname,
        })
    }

    /// Wait for the thread to finish.
    pub fn join(mut self) {
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Pin the calling thread to `core`. Logs and continues on failure.
pub fn pin_current_thread(core: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core % num_cores(), &mut set);
        let rc = libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        );
        if rc != 0 {
            wwarn!("failed to pin thread to core {}: errno {}", core, rc);
        }
    }
}

/// Number of online CPU cores.
pub fn num_cores() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n <= 0 {
        1
    } else {
        n as usize
    }
}
