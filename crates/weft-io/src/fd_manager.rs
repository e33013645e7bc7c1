//! Process-wide fd registry
//!
//! Maps each managed fd to its flags: is it a socket, has the runtime
//! set the kernel non-blocking bit, has the *user* asked for
//! non-blocking, and the per-direction timeouts. The syscall surface
//! consults this to decide whether a call is transformed at all.
//!
//! Concurrency: read lock for lookup, promoted to a write lock on grow,
//! with a double check under the write lock.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// Sentinel for "no timeout configured".
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Which direction a timeout guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

/// Per-fd flags.
pub struct FdInfo {
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdInfo {
    /// Probe the fd. Sockets get the kernel non-blocking flag set right
    /// away so the reactor can observe EAGAIN; the user-visible flag
    /// starts cleared.
    fn probe(fd: RawFd) -> FdInfo {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket =
            unsafe { libc::fstat(fd, &mut st) } == 0 && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 {
                if flags & libc::O_NONBLOCK == 0 {
                    unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
                }
                sys_nonblock = true;
            }
        }
        FdInfo {
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Relaxed);
    }

    /// Timeout for a direction, if one was configured.
    pub fn timeout_ms(&self, kind: TimeoutKind) -> Option<u64> {
        let v = match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Relaxed),
        };
        if v == NO_TIMEOUT {
            None
        } else {
            Some(v)
        }
    }

    pub fn set_timeout_ms(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Relaxed),
        }
    }
}

/// The registry: fd-indexed vector of `FdInfo`.
pub struct FdManager {
    fds: RwLock<Vec<Option<Arc<FdInfo>>>>,
}

impl FdManager {
    /// The process-wide instance.
    pub fn instance() -> &'static FdManager {
        static INSTANCE: OnceLock<FdManager> = OnceLock::new();
        INSTANCE.get_or_init(|| FdManager {
            fds: RwLock::new(Vec::new()),
        })
    }

    /// Look up an fd without creating it.
    pub fn get(&self, fd: RawFd) -> Option<Arc<FdInfo>> {
        if fd < 0 {
            return None;
        }
        let v = self.fds.read().unwrap();
        v.get(fd as usize).and_then(|slot| slot.clone())
    }

    /// Look up an fd, creating (and probing) it on first touch.
    pub fn register(&self, fd: RawFd) -> Option<Arc<FdInfo>> {
        if fd < 0 {
            return None;
        }
        if let Some(info) = self.get(fd) {
            return Some(info);
        }
        let mut v = self.fds.write().unwrap();
        let idx = fd as usize;
        if idx >= v.len() {
            v.resize(idx + idx / 2 + 1, None);
        }
        // Double check: another thread may have registered while we
        // waited for the write lock
        if v[idx].is_none() {
            v[idx] = Some(Arc::new(FdInfo::probe(fd)));
        }
        v[idx].clone()
    }

    /// Drop an fd's record (on close; dup2 over an open fd also lands
    /// here via re-registration).
    pub fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut v = self.fds.write().unwrap();
        if let Some(slot) = v.get_mut(fd as usize) {
            *slot = None;
        }
    }
}
