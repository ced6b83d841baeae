// ============================================================================
// CONNTRACK LIBRARY
// ============================================================================
// Reads the Linux netfilter connection tracking table over a netlink socket.
// No external `conntrack` binary and no netlink library: requests are encoded
// and replies decoded right here.
//
// === KEY FEATURES ===
// 1. Snapshot: all ESTABLISHED TCP connections that have a local endpoint
// 2. Follow: a live stream of TCP conntrack events (new, update, destroy)
// 3. Tracker: a continuously maintained set of established connections
//
// === PRIVILEGES ===
// Dumping the table and subscribing to events both need CAP_NET_ADMIN.
// Without it the operations fail with a permission error, nothing more.
//
// === PLATFORM ===
// Linux only. Netfilter netlink does not exist anywhere else.
// ============================================================================

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! Linux conntrack client over `NETLINK_NETFILTER`
//!
//! ```no_run
//! # fn main() -> conntrack::Result<()> {
//! for conn in conntrack::snapshot()? {
//!     println!("{conn}");
//! }
//!
//! let (events, stop) = conntrack::follow()?;
//! for event in events.take(10) {
//!     println!("{}", event?);
//! }
//! stop.stop();
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod local;
pub mod netlink;
pub mod tracker;

// === PUBLIC RE-EXPORTS ===
pub use address::Address;
pub use client::{
    Backend, ConnectionStream, NetlinkBackend, StopHandle, follow, follow_with, snapshot,
    snapshot_with,
};
pub use config::ConntrackConfig;
pub use connection::{ConnTCP, Connection, MsgType, tcp_state_name};
pub use error::{ConntrackError, Result};
pub use local::{InterfaceAddresses, LocalAddressProvider};
pub use tracker::Tracker;
