//! Hashable IP address value
//!
//! Conntrack hands us addresses as raw network-order bytes (4 for IPv4,
//! 16 for IPv6) and the interface enumeration hands us `std::net` types.
//! Both must land in the same `HashSet`, so this type normalizes them:
//!
//! - Storage is a fixed 16-byte buffer plus a length tag (4 or 16).
//! - An IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) is stored as the
//!   4-byte form, so `10.0.0.1` compares equal however it was encoded.
//! - Unused trailing bytes are always zero, which lets `Eq`/`Hash` be derived.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Serialize, Serializer};

/// Prefix of an IPv4-mapped IPv6 address
const V4_MAPPED_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff];

/// IPv4 or IPv6 address, canonicalized on construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address {
    len: u8,
    bytes: [u8; 16],
}

impl Address {
    /// Build from raw network-order bytes
    ///
    /// Returns `None` unless `raw` is exactly 4 or 16 bytes long.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        match raw.len() {
            4 => {
                let mut bytes = [0u8; 16];
                bytes[..4].copy_from_slice(raw);
                Some(Self { len: 4, bytes })
            }
            16 => {
                if raw[..12] == V4_MAPPED_PREFIX {
                    return Self::from_bytes(&raw[12..]);
                }
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(raw);
                Some(Self { len: 16, bytes })
            }
            _ => None,
        }
    }

    /// Significant bytes (4 or 16), empty for the default value
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    /// 4 for IPv4, 16 for IPv6, 0 when unset
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    /// True for the zero value a fresh `Connection` starts with
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_ipv4(&self) -> bool {
        self.len == 4
    }

    /// Convert to the standard library representation
    ///
    /// The unset value maps to `0.0.0.0`.
    pub fn to_ip(&self) -> IpAddr {
        if self.len == 16 {
            IpAddr::V6(Ipv6Addr::from(self.bytes))
        } else {
            IpAddr::V4(Ipv4Addr::new(
                self.bytes[0],
                self.bytes[1],
                self.bytes[2],
                self.bytes[3],
            ))
        }
    }
}

impl From<Ipv4Addr> for Address {
    fn from(ip: Ipv4Addr) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&ip.octets());
        Self { len: 4, bytes }
    }
}

impl From<Ipv6Addr> for Address {
    fn from(ip: Ipv6Addr) -> Self {
        // from_bytes folds the v4-mapped form; 16 bytes always succeeds
        Self::from_bytes(&ip.octets()).unwrap_or_default()
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => v4.into(),
            IpAddr::V6(v6) => v6.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ip())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
