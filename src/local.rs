//! Addresses bound to this host
//!
//! Conntrack reports every flow the kernel sees, including forwarded and
//! NATed ones, without saying which side is us. The set returned here is
//! what direction resolution checks endpoints against. It is computed once
//! per snapshot or follow session.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use tracing::warn;

use crate::address::Address;

/// Source of the local address set
///
/// Implemented by [`InterfaceAddresses`] for the real host and by
/// `HashSet<Address>` for a fixed set.
pub trait LocalAddressProvider {
    fn current_local_addresses(&self) -> HashSet<Address>;
}

/// Reads the addresses of all network interfaces via `getifaddrs(3)`
#[derive(Debug, Clone, Copy, Default)]
pub struct InterfaceAddresses;

impl LocalAddressProvider for InterfaceAddresses {
    fn current_local_addresses(&self) -> HashSet<Address> {
        match interface_addresses() {
            Ok(set) => set,
            Err(e) => {
                // An empty set only means no flow resolves to a direction
                warn!(error = %e, "getifaddrs() failed, treating no address as local");
                HashSet::new()
            }
        }
    }
}

impl LocalAddressProvider for HashSet<Address> {
    fn current_local_addresses(&self) -> HashSet<Address> {
        self.clone()
    }
}

/// Addresses of every interface that has an IP address
///
/// Non-IP entries (e.g. `AF_PACKET`) are skipped.
pub fn interface_addresses() -> std::io::Result<HashSet<Address>> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs fills head with a list we free below
    if unsafe { libc::getifaddrs(&raw mut head) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let mut set = HashSet::new();
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: cursor is a node of the list returned by getifaddrs
        let entry = unsafe { &*cursor };
        if let Some(addr) = sockaddr_to_address(entry.ifa_addr) {
            set.insert(addr);
        }
        cursor = entry.ifa_next;
    }

    // SAFETY: head came from a successful getifaddrs and is freed once
    unsafe { libc::freeifaddrs(head) };
    Ok(set)
}

fn sockaddr_to_address(sa: *const libc::sockaddr) -> Option<Address> {
    if sa.is_null() {
        return None;
    }
    // SAFETY: non-null ifa_addr points at a sockaddr whose family tells
    // us the concrete type
    unsafe {
        match i32::from((*sa).sa_family) {
            libc::AF_INET => {
                let sin = &*sa.cast::<libc::sockaddr_in>();
                Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)).into())
            }
            libc::AF_INET6 => {
                let sin6 = &*sa.cast::<libc::sockaddr_in6>();
                Some(Ipv6Addr::from(sin6.sin6_addr.s6_addr).into())
            }
            _ => None,
        }
    }
}
