//! Error types for conntrack operations
//!
//! Errors fall into two families:
//!
//! - **Transport**: a socket syscall failed (open, bind, setsockopt, send, recv)
//!   or the receive deadline passed before the kernel finished a dump.
//! - **Framing**: the byte stream coming back from the kernel cannot be
//!   interpreted (bad lengths, kernel-reported error, foreign subsystem).
//!
//! Both abort the current read loop. Attribute-level anomalies (unexpected
//! payload width, unknown type code) never become errors: the record builder
//! leaves the field at its default and keeps going.
//!
//! A caller stopping a follow session is not an error either. The stream just
//! ends, see [`crate::client::StopHandle`].

use std::io;

use thiserror::Error;

/// Everything that can go wrong talking to ctnetlink
#[derive(Debug, Error)]
pub enum ConntrackError {
    /// A socket syscall failed
    #[error("{context}: {source}")]
    Socket {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// No datagram arrived within the receive timeout while a dump was open
    #[error("timed out waiting for the kernel to finish the dump")]
    Timeout,

    /// The kernel answered with an `NLMSG_ERROR` carrying a nonzero errno
    #[error("kernel reported error: {}", io::Error::from_raw_os_error(*errno))]
    Kernel { errno: i32 },

    /// Malformed netlink or attribute framing
    #[error("framing error: {0}")]
    Framing(String),

    /// A message arrived for a netfilter subsystem other than ctnetlink
    #[error("unexpected netfilter subsystem id: {0}")]
    UnexpectedSubsystem(u8),

    /// The kernel dropped events because our receive buffer overflowed
    ///
    /// Reported on a follow stream as a single item; the stream keeps going.
    #[error("kernel dropped conntrack events (socket receive buffer overrun)")]
    Overrun,
}

impl ConntrackError {
    pub(crate) fn socket(context: &'static str, source: io::Error) -> Self {
        Self::Socket { context, source }
    }

    pub(crate) fn framing(message: impl Into<String>) -> Self {
        Self::Framing(message.into())
    }

    /// Socket level failure (including the receive deadline)
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Socket { .. } | Self::Timeout | Self::Overrun)
    }

    /// The kernel byte stream could not be interpreted
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Self::Kernel { .. } | Self::Framing(_) | Self::UnexpectedSubsystem(_)
        )
    }

    /// Permission problems deserve a friendlier hint in the binary
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Socket { source, .. } => source.kind() == io::ErrorKind::PermissionDenied,
            Self::Kernel { errno } => *errno == libc::EPERM || *errno == libc::EACCES,
            _ => false,
        }
    }
}

pub type Result<T, E = ConntrackError> = std::result::Result<T, E>;
