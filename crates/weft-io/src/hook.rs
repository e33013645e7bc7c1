//! Blocking-style syscall surface for fibers
//!
//! Each function here mirrors a libc call. On a worker thread with the
//! layer enabled, calls against registry-managed sockets are issued
//! non-blockingly; on EAGAIN the calling fiber arms an epoll event (plus
//! a deadline timer when the fd has one configured) and parks. When the
//! reactor wakes it the call retries, so user code sees plain blocking
//! behavior: it gets its bytes or it gets an errno, and never EAGAIN.
//!
//! Off a worker thread, with the layer disabled, for non-sockets, or
//! when the user explicitly asked for non-blocking, every function falls
//! through to the real syscall.
//!
//! Return conventions follow libc: a count or 0 on success, -1 with
//! errno set on failure.

use crate::fd_context::IoEvent;
use crate::fd_manager::{FdManager, TimeoutKind};
use crate::io_manager::IoManager;
use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use weft_core::werror;
use weft_runtime::fiber::Fiber;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread transforms blocking calls.
#[inline]
pub fn is_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Enable or disable the transformation on the current thread. The
/// scheduler enables it on every worker; runtime-internal code may
/// disable it around calls that must hit the kernel directly.
#[inline]
pub fn set_enabled(on: bool) {
    HOOK_ENABLED.with(|c| c.set(on));
}

#[inline]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(e: i32) {
    unsafe { *libc::__errno_location() = e }
}

/// Deadline flag shared between a parked I/O call and its timer: the
/// timer stores the errno it cancelled with (ETIMEDOUT), the I/O side
/// reads it after waking. The weak reference held by the condition timer
/// keeps a dead call from being cancelled.
#[derive(Default)]
struct DeadlineFlag {
    cancelled: AtomicI32,
}

/// The uniform transformation for read/write-shaped calls.
///
/// 1. Pass through when not transforming.
/// 2. Try the real call, retrying around EINTR.
/// 3. On EAGAIN: arm the event (and a condition timer when the fd has a
///    timeout for this direction), park the fiber.
/// 4. Awake: if the timer fired, fail with ETIMEDOUT; else retry.
fn do_io<F>(fd: RawFd, event: IoEvent, timeout_kind: TimeoutKind, raw: F) -> isize
where
    F: Fn() -> isize,
{
    if !is_enabled() {
        return raw();
    }
    let Some(info) = FdManager::instance().get(fd) else {
        return raw();
    };
    if !info.is_socket() || info.user_nonblock() {
        return raw();
    }
    let timeout = info.timeout_ms(timeout_kind);
    let flag = Arc::new(DeadlineFlag::default());

    loop {
        let mut n = raw();
        while n == -1 && errno() == libc::EINTR {
            n = raw();
        }
        if !(n == -1 && errno() == libc::EAGAIN) {
            return n;
        }

        let Some(iom) = IoManager::current() else {
            // Not on a reactor thread; nothing to park on
            return n;
        };
        let timer = timeout.map(|ms| {
            let weak = Arc::downgrade(&flag);
            let iom2 = iom.clone();
            iom.add_condition_timer(
                ms,
                Arc::new(move || {
                    let Some(f) = weak.upgrade() else { return };
                    if f.cancelled.load(Ordering::SeqCst) != 0 {
                        return;
                    }
                    f.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                    iom2.cancel_event(fd, event);
                }),
                Arc::downgrade(&flag),
            )
        });

        match iom.add_event(fd, event, None) {
            Err(e) => {
                werror!("do_io: arming fd {} {:?} failed: {}", fd, event, e);
                if let Some(t) = timer {
                    t.cancel();
                }
                return -1;
            }
            Ok(()) => {
                Fiber::current().yield_waiting();
                // Timer and event cancellation are idempotent in either
                // order; whichever side lost sees the armed bit cleared
                if let Some(t) = timer {
                    t.cancel();
                }
                let c = flag.cancelled.load(Ordering::SeqCst);
                if c != 0 {
                    set_errno(c);
                    return -1;
                }
                // Event fired: retry the call
            }
        }
    }
}

// ── Sleep family ──

/// Park the current fiber for `ms` milliseconds. Falls back to a thread
/// sleep off the runtime.
pub fn sleep_ms(ms: u64) {
    if !is_enabled() {
        std::thread::sleep(std::time::Duration::from_millis(ms));
        return;
    }
    let Some(iom) = IoManager::current() else {
        std::thread::sleep(std::time::Duration::from_millis(ms));
        return;
    };
    let fiber = Fiber::current();
    if fiber.is_root() {
        std::thread::sleep(std::time::Duration::from_millis(ms));
        return;
    }
    let sched = iom.sched().clone();
    let target = fiber.clone();
    iom.add_timer(
        ms,
        Arc::new(move || {
            sched.schedule_fiber(target.clone(), None);
        }),
        false,
    );
    fiber.yield_waiting();
}

/// Seconds-granularity sleep. Always returns 0.
pub fn sleep(seconds: u32) -> u32 {
    sleep_ms(seconds as u64 * 1000);
    0
}

/// Microsecond sleep, rounded down to milliseconds like the original
/// interface it mirrors.
pub fn usleep(usec: u64) -> i32 {
    sleep_ms(usec / 1000);
    0
}

/// Nanosecond sleep, rounded down to milliseconds.
pub fn nanosleep(req: &libc::timespec) -> i32 {
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    sleep_ms(ms);
    0
}

// ── Socket lifecycle ──

/// Create a socket and register it with the fd registry.
pub fn socket(domain: i32, ty: i32, protocol: i32) -> i32 {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if is_enabled() && fd >= 0 {
        FdManager::instance().register(fd);
    }
    fd
}

/// Connect with an explicit timeout in milliseconds (`u64::MAX` for
/// none). Parks on writability until the handshake resolves, then reads
/// SO_ERROR for the verdict.
pub fn connect_with_timeout(
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout_ms: u64,
) -> i32 {
    if !is_enabled() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }
    let Some(info) = FdManager::instance().get(fd) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if !info.is_socket() || info.user_nonblock() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }

    let n = unsafe { libc::connect(fd, addr, addrlen) };
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }
    let Some(iom) = IoManager::current() else {
        return n;
    };

    let flag = Arc::new(DeadlineFlag::default());
    let timer = (timeout_ms != u64::MAX).then(|| {
        let weak = Arc::downgrade(&flag);
        let iom2 = iom.clone();
        iom.add_condition_timer(
            timeout_ms,
            Arc::new(move || {
                let Some(f) = weak.upgrade() else { return };
                if f.cancelled.load(Ordering::SeqCst) != 0 {
                    return;
                }
                f.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                iom2.cancel_event(fd, IoEvent::Write);
            }),
            Arc::downgrade(&flag),
        )
    });

    match iom.add_event(fd, IoEvent::Write, None) {
        Ok(()) => {
            Fiber::current().yield_waiting();
            if let Some(t) = timer {
                t.cancel();
            }
            let c = flag.cancelled.load(Ordering::SeqCst);
            if c != 0 {
                set_errno(c);
                return -1;
            }
        }
        Err(e) => {
            if let Some(t) = timer {
                t.cancel();
            }
            werror!("connect: arming fd {} for write failed: {}", fd, e);
        }
    }

    // The handshake resolved (or was never armed); ask the kernel how
    let mut err: i32 = 0;
    let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut i32 as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == -1 {
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(err);
        -1
    }
}

/// Connect with the configured default timeout.
pub fn connect(fd: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> i32 {
    let timeout = IoManager::current()
        .map(|m| m.config().connect_timeout_ms)
        .unwrap_or(u64::MAX);
    connect_with_timeout(fd, addr, addrlen, timeout)
}

/// Accept a connection; the new fd is registered with the registry.
pub fn accept(fd: RawFd, addr: *mut libc::sockaddr, addrlen: *mut libc::socklen_t) -> i32 {
    let n = do_io(fd, IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::accept(fd, addr, addrlen) as isize
    }) as i32;
    if n >= 0 {
        FdManager::instance().register(n);
    }
    n
}

/// Cancel all pending events on the fd (their waiters run with the fd
/// gone), drop its registry entry, and close it.
///
/// The registry entry is dropped even with the layer disabled: fd
/// numbers are reused by the kernel, and a stale entry would hand the
/// next owner of this number the wrong flags.
pub fn close(fd: RawFd) -> i32 {
    if FdManager::instance().get(fd).is_some() {
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        FdManager::instance().remove(fd);
    }
    unsafe { libc::close(fd) }
}

// ── Read family ──

pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    let p = buf.as_mut_ptr();
    let len = buf.len();
    do_io(fd, IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::read(fd, p as *mut libc::c_void, len)
    })
}

pub fn readv(fd: RawFd, iov: &[libc::iovec]) -> isize {
    let p = iov.as_ptr();
    let n = iov.len() as i32;
    do_io(fd, IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::readv(fd, p, n)
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> isize {
    let p = buf.as_mut_ptr();
    let len = buf.len();
    do_io(fd, IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, p as *mut libc::c_void, len, flags)
    })
}

pub fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: i32,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> isize {
    let p = buf.as_mut_ptr();
    let len = buf.len();
    do_io(fd, IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::recvfrom(fd, p as *mut libc::c_void, len, flags, src_addr, addrlen)
    })
}

pub fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: i32) -> isize {
    do_io(fd, IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

// ── Write family ──

pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    let p = buf.as_ptr();
    let len = buf.len();
    do_io(fd, IoEvent::Write, TimeoutKind::Send, || unsafe {
        libc::write(fd, p as *const libc::c_void, len)
    })
}

pub fn writev(fd: RawFd, iov: &[libc::iovec]) -> isize {
    let p = iov.as_ptr();
    let n = iov.len() as i32;
    do_io(fd, IoEvent::Write, TimeoutKind::Send, || unsafe {
        libc::writev(fd, p, n)
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> isize {
    let p = buf.as_ptr();
    let len = buf.len();
    do_io(fd, IoEvent::Write, TimeoutKind::Send, || unsafe {
        libc::send(fd, p as *const libc::c_void, len, flags)
    })
}

pub fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: i32,
    dest_addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> isize {
    let p = buf.as_ptr();
    let len = buf.len();
    do_io(fd, IoEvent::Write, TimeoutKind::Send, || unsafe {
        libc::sendto(fd, p as *const libc::c_void, len, flags, dest_addr, addrlen)
    })
}

pub fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: i32) -> isize {
    do_io(fd, IoEvent::Write, TimeoutKind::Send, || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}

// ── Fd control ──

/// F_SETFL: record the user's non-blocking intent; the kernel flag stays
/// whatever the runtime needs.
pub fn fcntl_setfl(fd: RawFd, mut flags: i32) -> i32 {
    match FdManager::instance().get(fd) {
        Some(info) if info.is_socket() => {
            info.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
            if info.sys_nonblock() {
                flags |= libc::O_NONBLOCK;
            } else {
                flags &= !libc::O_NONBLOCK;
            }
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags) }
        }
        _ => unsafe { libc::fcntl(fd, libc::F_SETFL, flags) },
    }
}

/// F_GETFL: report the user's view of O_NONBLOCK, not the kernel's.
pub fn fcntl_getfl(fd: RawFd) -> i32 {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return flags;
    }
    match FdManager::instance().get(fd) {
        Some(info) if info.is_socket() => {
            if info.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        _ => flags,
    }
}

/// FIONBIO: same interception as F_SETFL.
pub fn ioctl_fionbio(fd: RawFd, nonblocking: bool) -> i32 {
    if let Some(info) = FdManager::instance().get(fd) {
        if info.is_socket() {
            info.set_user_nonblock(nonblocking);
            // The kernel flag stays set; report success
            return 0;
        }
    }
    let mut v: libc::c_int = nonblocking as libc::c_int;
    unsafe { libc::ioctl(fd, libc::FIONBIO, &mut v as *mut libc::c_int) }
}

/// Plain passthrough.
pub fn getsockopt(
    fd: RawFd,
    level: i32,
    optname: i32,
    optval: *mut libc::c_void,
    optlen: *mut libc::socklen_t,
) -> i32 {
    unsafe { libc::getsockopt(fd, level, optname, optval, optlen) }
}

/// SO_RCVTIMEO / SO_SNDTIMEO are routed into the registry so the I/O
/// transformation can honor them; everything else passes through.
pub fn setsockopt(
    fd: RawFd,
    level: i32,
    optname: i32,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> i32 {
    if is_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
    {
        if let Some(info) = FdManager::instance().get(fd) {
            let tv = unsafe { &*(optval as *const libc::timeval) };
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            info.set_timeout_ms(kind, ms);
        }
    }
    unsafe { libc::setsockopt(fd, level, optname, optval, optlen) }
}

/// dup: the new fd must be registered immediately or later I/O on it
/// would bypass the transformation.
pub fn dup(oldfd: RawFd) -> i32 {
    let newfd = unsafe { libc::dup(oldfd) };
    if is_enabled() && newfd >= 0 {
        FdManager::instance().register(newfd);
    }
    newfd
}

/// dup2: if newfd was open the kernel closed it; re-registration
/// replaces any stale record.
pub fn dup2(oldfd: RawFd, newfd: RawFd) -> i32 {
    let ret = unsafe { libc::dup2(oldfd, newfd) };
    if is_enabled() && ret >= 0 {
        FdManager::instance().remove(newfd);
        FdManager::instance().register(newfd);
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_falls_through() {
        assert!(!is_enabled());
        // A pipe read end: not a socket, not registered; read must hit
        // the real syscall and see the written bytes
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert_eq!(write(fds[1], b"xy"), 2);
        let mut buf = [0u8; 8];
        assert_eq!(read(fds[0], &mut buf), 2);
        assert_eq!(&buf[..2], b"xy");
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_user_nonblock_view() {
        set_enabled(true);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        // The runtime set the kernel flag, the user has not asked for it
        let seen = fcntl_getfl(fd);
        assert_eq!(seen & libc::O_NONBLOCK, 0, "user view starts blocking");

        // User opts in; the view follows
        fcntl_setfl(fd, seen | libc::O_NONBLOCK);
        assert_ne!(fcntl_getfl(fd) & libc::O_NONBLOCK, 0);

        // Kernel flag stayed set throughout
        let raw = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert_ne!(raw & libc::O_NONBLOCK, 0);

        set_enabled(false);
        unsafe { libc::close(fd) };
        FdManager::instance().remove(fd);
    }

    #[test]
    fn test_setsockopt_routes_timeouts() {
        set_enabled(true);
        let fd = socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        let tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 50_000,
        };
        setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const libc::timeval as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        );
        let info = FdManager::instance().get(fd).unwrap();
        assert_eq!(info.timeout_ms(TimeoutKind::Recv), Some(50));
        set_enabled(false);
        unsafe { libc::close(fd) };
        FdManager::instance().remove(fd);
    }

    #[test]
    fn test_dup_registers_new_fd() {
        set_enabled(true);
        let fd = socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        let d = dup(fd);
        assert!(d >= 0);
        assert!(FdManager::instance().get(d).is_some());
        set_enabled(false);
        unsafe {
            libc::close(fd);
            libc::close(d);
        }
        FdManager::instance().remove(fd);
        FdManager::instance().remove(d);
    }
}
