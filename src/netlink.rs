//! Netfilter netlink (ctnetlink) protocol
//!
//! Everything below the client operations: bytes on the wire, and the
//! socket they travel through.
//!
//! # Layers
//!
//! - `structures`: header layouts, wire constants, alignment helpers
//! - `attributes`: type-length-value attribute walking and encoding
//! - `conntrack`: one conntrack record out of an attribute tree
//! - `message`: dump request, datagram splitting, message dispatch
//! - `socket`: `AF_NETLINK` socket management (syscalls, RAII)
//!
//! Headers are native endian. Attribute payloads that carry ports,
//! addresses and counters are big endian.

// ============================================================================
// SUBMODULE DECLARATIONS
// ============================================================================

pub mod attributes; // TLV iteration, tagged dispatch, encoder
pub mod conntrack; // Record builder
pub mod message; // Request encoding and message dispatch
pub mod socket; // Netlink socket management (Linux only)
pub mod structures; // Wire structures and constants

// ============================================================================
// PUBLIC RE-EXPORTS
// ============================================================================

pub use conntrack::build_connection;
pub use message::{BufferStatus, Dispatched, build_dump_request, dispatch_buffer, dispatch_message};
pub use socket::{NetlinkSocket, Received};
