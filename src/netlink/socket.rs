//! Netlink socket management
//!
//! Provides a safe wrapper around the `AF_NETLINK` / `NETLINK_NETFILTER`
//! socket lifecycle. The socket is closed when the wrapper is dropped.
//!
//! # Two Modes
//!
//! - **Request/response** (`groups == 0`): send a dump request, read the
//!   replies until `NLMSG_DONE`.
//! - **Subscription** (`groups != 0`): bind to the conntrack multicast
//!   groups and never send anything; the kernel pushes an event for every
//!   new, updated and destroyed flow.
//!
//! # Unsafe Rust
//!
//! `socket()`, `bind()`, `setsockopt()`, `sendto()` and `recv()` are raw
//! libc calls. Each one is wrapped in a safe method that checks the return
//! value and turns `errno` into a [`ConntrackError`].

use std::io;
use std::os::unix::io::RawFd;

use tracing::debug;

use crate::config::ConntrackConfig;
use crate::error::{ConntrackError, Result};
use crate::netlink::structures::NETLINK_NETFILTER;

/// Outcome of one receive call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// Number of bytes written into the buffer
    Data(usize),
    /// `SO_RCVTIMEO` elapsed without a datagram
    TimedOut,
}

/// Netlink socket wrapper with automatic cleanup
pub struct NetlinkSocket {
    fd: RawFd,
}

impl NetlinkSocket {
    /// Open a netfilter netlink socket and bind it to `groups`
    ///
    /// Steps:
    /// 1. `socket(AF_NETLINK, SOCK_RAW, NETLINK_NETFILTER)`
    /// 2. `bind()` with the multicast group bitmask (0 for none)
    /// 3. `SO_RCVBUF` and `SO_RCVTIMEO` from `config`
    ///
    /// # Errors
    ///
    /// `ConntrackError::Socket` if any syscall fails. Subscribing to
    /// conntrack groups needs `CAP_NET_ADMIN`.
    pub fn open(groups: u32, config: &ConntrackConfig) -> Result<Self> {
        // SAFETY: plain syscall, return value checked below
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_NETFILTER,
            )
        };
        if fd < 0 {
            return Err(ConntrackError::socket("socket() failed", io::Error::last_os_error()));
        }

        // From here on Drop closes the fd on every error path
        let socket = Self { fd };

        let mut addr = kernel_addr();
        addr.nl_groups = groups;
        // SAFETY: addr is a fully initialized sockaddr_nl and we pass its exact size
        let ret = unsafe {
            libc::bind(
                socket.fd,
                (&raw const addr).cast::<libc::sockaddr>(),
                size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(ConntrackError::socket("bind() failed", io::Error::last_os_error()));
        }

        let rcvbuf = libc::c_int::try_from(config.recv_buffer_bytes).unwrap_or(libc::c_int::MAX);
        socket.set_option(libc::SO_RCVBUF, &rcvbuf, "setsockopt(SO_RCVBUF) failed")?;

        let timeout = config.recv_timeout();
        let tv = libc::timeval {
            tv_sec: libc::time_t::try_from(timeout.as_secs()).unwrap_or(libc::time_t::MAX),
            tv_usec: libc::suseconds_t::from(timeout.subsec_micros() as i32),
        };
        socket.set_option(libc::SO_RCVTIMEO, &tv, "setsockopt(SO_RCVTIMEO) failed")?;

        debug!(fd = socket.fd, groups, "netfilter netlink socket open");
        Ok(socket)
    }

    fn set_option<T>(&self, name: libc::c_int, value: &T, context: &'static str) -> Result<()> {
        // SAFETY: value points to a live T and we pass size_of::<T>()
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                name,
                std::ptr::from_ref(value).cast::<libc::c_void>(),
                size_of::<T>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(ConntrackError::socket(context, io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Send one complete request to the kernel
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let addr = kernel_addr();
        // SAFETY: data is valid for data.len() bytes, addr for its size
        let ret = unsafe {
            libc::sendto(
                self.fd,
                data.as_ptr().cast::<libc::c_void>(),
                data.len(),
                0,
                (&raw const addr).cast::<libc::sockaddr>(),
                size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(ConntrackError::socket("sendto() failed", io::Error::last_os_error()));
        }
        if ret as usize != data.len() {
            return Err(ConntrackError::socket(
                "sendto() failed",
                io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short send: sent {} of {} bytes", ret, data.len()),
                ),
            ));
        }
        Ok(())
    }

    /// Receive one datagram (one or more netlink messages) into `buffer`
    ///
    /// `EINTR` is retried. A receive timeout is not an error here; the
    /// caller decides what it means.
    ///
    /// # Errors
    ///
    /// - `ConntrackError::Overrun` on `ENOBUFS`: the kernel dropped messages
    ///   because the socket buffer was full. The socket stays usable.
    /// - `ConntrackError::Socket` for anything else.
    pub fn recv(&self, buffer: &mut [u8]) -> Result<Received> {
        loop {
            // SAFETY: buffer is valid and writable for buffer.len() bytes
            let ret = unsafe {
                libc::recv(
                    self.fd,
                    buffer.as_mut_ptr().cast::<libc::c_void>(),
                    buffer.len(),
                    0,
                )
            };
            if ret >= 0 {
                return Ok(Received::Data(ret as usize));
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => {}
                Some(libc::EAGAIN | libc::ETIMEDOUT) => return Ok(Received::TimedOut),
                Some(libc::ENOBUFS) => return Err(ConntrackError::Overrun),
                _ => return Err(ConntrackError::socket("recv() failed", err)),
            }
        }
    }
}

/// Allocate the receive buffer: one page, which fits a whole netlink datagram
pub fn recv_buffer() -> Vec<u8> {
    // SAFETY: sysconf has no preconditions
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    vec![0u8; usize::try_from(page).ok().filter(|p| *p > 0).unwrap_or(4096)]
}

/// `sockaddr_nl` addressing the kernel (pid 0, no groups)
fn kernel_addr() -> libc::sockaddr_nl {
    // SAFETY: sockaddr_nl is plain old data, all-zero is valid
    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        // SAFETY: we own fd and it is closed exactly once, here
        unsafe {
            libc::close(self.fd);
        }
        debug!(fd = self.fd, "netfilter netlink socket closed");
    }
}

// ============================================================================
// TESTS
// ============================================================================
