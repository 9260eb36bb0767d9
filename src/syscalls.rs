// src/syscalls.rs
//
// Thin wrappers over the raw socket, epoll, eventfd and timerfd syscalls the
// reactor is built on. Everything above this module works in terms of plain
// file descriptors.
use crate::error::MillResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::error;

/// Listen backlog for the accept queue.
pub const MAX_LISTEN: c_int = 1024;

// ---- Socket operations ----

/// Create an IPv4 listening socket bound to 0.0.0.0:`port`.
///
/// The listener is non-blocking and carries SO_REUSEADDR | SO_REUSEPORT so a
/// restarted server can rebind immediately. Accepted sockets stay blocking;
/// the framework drives them with MSG_DONTWAIT.
pub fn create_listen_socket(port: u16) -> MillResult<c_int> {
    unsafe {
        let fd = libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
            libc::IPPROTO_TCP,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY.to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of_val(&addr) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if libc::listen(fd, MAX_LISTEN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Create a blocking IPv4 stream socket connected to `ip:port`.
pub fn create_client_socket(ip: [u8; 4], port: u16) -> MillResult<c_int> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_TCP);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(ip),
            },
            sin_zero: [0; 8],
        };
        if libc::connect(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of_val(&addr) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
        Ok(fd)
    }
}

/// Put an fd into non-blocking mode.
pub fn set_nonblocking(fd: c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Accept one pending connection. `Ok(None)` means the accept queue is empty.
pub fn accept_connection(listen_fd: c_int) -> io::Result<Option<c_int>> {
    unsafe {
        let fd = libc::accept(listen_fd, ptr::null_mut(), ptr::null_mut());
        if fd < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => Ok(None),
                _ => Err(err),
            }
        } else {
            Ok(Some(fd))
        }
    }
}

/// Non-blocking receive. `Ok(0)` means no data was available this round;
/// an orderly close by the peer is reported as `UnexpectedEof` so the read
/// path can run its shutdown-with-drain sequence.
pub fn recv_nonblocking(fd: c_int, buf: &mut [u8]) -> io::Result<usize> {
    unsafe {
        let ret = libc::recv(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
        );
        if ret < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => Ok(0),
                _ => Err(err),
            };
        }
        if ret == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            ));
        }
        Ok(ret as usize)
    }
}

/// Non-blocking send. `Ok(0)` means the kernel send buffer is full.
pub fn send_nonblocking(fd: c_int, buf: &[u8]) -> io::Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    unsafe {
        let ret = libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
        );
        if ret < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => Ok(0),
                _ => Err(err),
            };
        }
        Ok(ret as usize)
    }
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

/// Suppress SIGPIPE process-wide so writes to a reset connection surface as
/// EPIPE instead of killing the process.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Owned wrapper over a stream-socket fd. Close is idempotent: the fd slot is
/// swapped to -1 so an explicit `close()` followed by drop is safe.
pub struct Socket {
    fd: AtomicI32,
}

impl Socket {
    pub fn new(fd: c_int) -> Self {
        Self {
            fd: AtomicI32::new(fd),
        }
    }

    pub fn fd(&self) -> c_int {
        self.fd.load(Ordering::Acquire)
    }

    pub fn recv_nonblocking(&self, buf: &mut [u8]) -> io::Result<usize> {
        recv_nonblocking(self.fd(), buf)
    }

    pub fn send_nonblocking(&self, buf: &[u8]) -> io::Result<usize> {
        send_nonblocking(self.fd(), buf)
    }

    pub fn close(&self) {
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            close_fd(fd);
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

// ---- Wakeup and timer descriptors ----

/// Create the eventfd used to wake a loop blocked in epoll_wait. Creation
/// failure is fatal at boot.
pub fn create_event_fd() -> c_int {
    unsafe {
        let fd = libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK);
        if fd < 0 {
            error!(error = %io::Error::last_os_error(), "eventfd create failed");
            std::process::abort();
        }
        fd
    }
}

/// Drain the eventfd counter. Wakeups coalesce: many writes, one read.
pub fn read_event_fd(fd: c_int) {
    unsafe {
        let mut val: u64 = 0;
        let ret = libc::read(fd, &mut val as *mut u64 as *mut c_void, 8);
        if ret < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => {}
                _ => {
                    error!(error = %err, "eventfd read failed");
                    std::process::abort();
                }
            }
        }
    }
}

/// Bump the eventfd counter to wake the owning loop.
pub fn write_event_fd(fd: c_int) {
    unsafe {
        let val: u64 = 1;
        let ret = libc::write(fd, &val as *const u64 as *const c_void, 8);
        if ret < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => {}
                _ => {
                    error!(error = %err, "eventfd write failed");
                    std::process::abort();
                }
            }
        }
    }
}

/// Create the monotonic timerfd that ticks the timing wheel once per second.
/// Creation failure is fatal at boot.
pub fn create_timer_fd() -> c_int {
    unsafe {
        let fd = libc::timerfd_create(libc::CLOCK_MONOTONIC, 0);
        if fd < 0 {
            error!(error = %io::Error::last_os_error(), "timerfd create failed");
            std::process::abort();
        }
        let spec = libc::itimerspec {
            it_value: libc::timespec {
                tv_sec: 1,
                tv_nsec: 0,
            },
            it_interval: libc::timespec {
                tv_sec: 1,
                tv_nsec: 0,
            },
        };
        libc::timerfd_settime(fd, 0, &spec, ptr::null_mut());
        fd
    }
}

/// Read the number of expirations since the previous read. A slow dispatch
/// round can miss several ticks; the caller advances the wheel that many
/// times.
pub fn read_timer_fd(fd: c_int) -> u64 {
    unsafe {
        let mut times: u64 = 0;
        let ret = libc::read(fd, &mut times as *mut u64 as *mut c_void, 8);
        if ret < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => return 0,
                _ => {
                    error!(error = %err, "timerfd read failed");
                    std::process::abort();
                }
            }
        }
        times
    }
}

// ---- Epoll operations ----

/// Level-triggered epoll instance. The token carried in each event is the
/// registered fd itself.
pub struct Epoll {
    fd: c_int,
}

impl Epoll {
    /// Creation failure is fatal at boot.
    pub fn new() -> Self {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                error!(error = %io::Error::last_os_error(), "epoll create failed");
                std::process::abort();
            }
            Self { fd }
        }
    }

    pub fn add(&self, fd: c_int, interests: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interests)
    }

    pub fn modify(&self, fd: c_int, interests: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interests)
    }

    pub fn delete(&self, fd: c_int) -> io::Result<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                // The fd may already be gone from the interest list.
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn ctl(&self, op: c_int, fd: c_int, interests: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests,
            u64: fd as u64,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Block until readiness. EINTR is reported as zero events.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: c_int) -> io::Result<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err);
            }
            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        close_fd(self.fd);
    }
}
