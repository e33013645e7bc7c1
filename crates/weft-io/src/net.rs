//! Fiber-friendly TCP wrappers
//!
//! `Listener` and `Stream` wrap raw fds over the hooked syscall surface,
//! giving straight-line accept/read/write code inside fibers. Errors are
//! returned as negative errno values, matching the syscall layer.

use crate::fd_manager::FdManager;
use crate::hook;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;

/// A listening TCP socket.
pub struct Listener {
    fd: RawFd,
}

impl Listener {
    /// Bind and listen on `addr` with SO_REUSEADDR/SO_REUSEPORT and
    /// TCP_NODELAY applied.
    pub fn bind(addr: SocketAddrV4) -> Result<Listener, i32> {
        let fd = bind_socket(addr)?;
        unsafe { libc::listen(fd, 4096) };
        Ok(Listener { fd })
    }

    /// Accept one connection, parking the calling fiber until a client
    /// arrives.
    pub fn accept(&self) -> Result<Stream, i32> {
        let client = hook::accept(self.fd, std::ptr::null_mut(), std::ptr::null_mut());
        if client < 0 {
            return Err(last_errno());
        }
        set_nodelay(client);
        Ok(Stream { fd: client })
    }

    /// The address actually bound (resolves port 0).
    pub fn local_addr(&self) -> Result<SocketAddrV4, i32> {
        let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.fd,
                &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(last_errno());
        }
        Ok(SocketAddrV4::new(
            std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
            u16::from_be(sa.sin_port),
        ))
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        hook::close(self.fd);
    }
}

/// A connected TCP stream.
pub struct Stream {
    fd: RawFd,
}

impl Stream {
    /// Connect to `addr`, honoring the runtime's default connect
    /// timeout.
    pub fn connect(addr: SocketAddrV4) -> Result<Stream, i32> {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(last_errno());
        }
        FdManager::instance().register(fd);
        let sa = sockaddr_from(addr);
        let rc = hook::connect(
            fd,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        if rc != 0 {
            let e = last_errno();
            hook::close(fd);
            return Err(e);
        }
        set_nodelay(fd);
        Ok(Stream { fd })
    }

    /// As `connect` with an explicit timeout in milliseconds.
    pub fn connect_timeout(addr: SocketAddrV4, timeout_ms: u64) -> Result<Stream, i32> {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(last_errno());
        }
        FdManager::instance().register(fd);
        let sa = sockaddr_from(addr);
        let rc = hook::connect_with_timeout(
            fd,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            timeout_ms,
        );
        if rc != 0 {
            let e = last_errno();
            hook::close(fd);
            return Err(e);
        }
        set_nodelay(fd);
        Ok(Stream { fd })
    }

    /// Read into `buf`. Parks the fiber until data, EOF (0) or error
    /// (negative errno).
    pub fn read(&self, buf: &mut [u8]) -> isize {
        let n = hook::read(self.fd, buf);
        if n < 0 {
            -(last_errno() as isize)
        } else {
            n
        }
    }

    /// Single write. Returns bytes written or negative errno.
    pub fn write(&self, buf: &[u8]) -> isize {
        let n = hook::write(self.fd, buf);
        if n < 0 {
            -(last_errno() as isize)
        } else {
            n
        }
    }

    /// Write the whole buffer, retrying partial writes. Returns the
    /// total or negative errno.
    pub fn write_all(&self, mut buf: &[u8]) -> isize {
        let mut total = 0isize;
        while !buf.is_empty() {
            let n = hook::write(self.fd, buf);
            if n < 0 {
                let e = last_errno();
                if e == libc::EINTR {
                    continue;
                }
                return -(e as isize);
            }
            total += n;
            buf = &buf[n as usize..];
        }
        total
    }

    /// Configure the receive timeout used by parked reads.
    pub fn set_read_timeout_ms(&self, ms: u64) {
        set_timeout(self.fd, libc::SO_RCVTIMEO, ms);
    }

    /// Configure the send timeout used by parked writes.
    pub fn set_write_timeout_ms(&self, ms: u64) {
        set_timeout(self.fd, libc::SO_SNDTIMEO, ms);
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

fn set_timeout(fd: RawFd, optname: i32, ms: u64) {
    let tv = libc::timeval {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
    };
    hook::setsockopt(
        fd,
        libc::SOL_SOCKET,
        optname,
        &tv as *const libc::timeval as *const libc::c_void,
        std::mem::size_of::<libc::timeval>() as libc::socklen_t,
    );
}

impl Drop for Stream {
    fn drop(&mut self) {
        hook::close(self.fd);
    }
}

fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

fn sockaddr_from(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
    sa
}

fn set_nodelay(fd: RawFd) {
    let opt: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &opt as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

fn bind_socket(addr: SocketAddrV4) -> Result<RawFd, i32> {
    let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
    if fd < 0 {
        return Err(last_errno());
    }
    // Register even off a worker thread so accept/read on fibers are
    // transformed from the first call
    FdManager::instance().register(fd);
    let opt: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &opt as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    let sa = sockaddr_from(addr);
    let rc = unsafe {
        libc::bind(
            fd,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        let e = last_errno();
        unsafe { libc::close(fd) };
        FdManager::instance().remove(fd);
        return Err(e);
    }
    Ok(fd)
}
