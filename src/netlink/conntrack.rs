//! Conntrack record builder
//!
//! Turns the attribute tree of one ctnetlink message into a [`Connection`].
//!
//! # Attribute Tree
//!
//! ```text
//! CTA_TUPLE_REPLY ─┬─ CTA_TUPLE_IP ────┬─ CTA_IP_V4_SRC   (4 bytes)
//!                  │                   ├─ CTA_IP_V4_DST   (4 bytes)
//!                  │                   └─ CTA_IP_V6_*     (recognized, not decoded)
//!                  └─ CTA_TUPLE_PROTO ─┬─ CTA_PROTO_NUM   (1 byte)
//!                                      ├─ CTA_PROTO_SRC_PORT (2 bytes, BE)
//!                                      └─ CTA_PROTO_DST_PORT (2 bytes, BE)
//! CTA_STATUS
//! CTA_PROTOINFO ─── CTA_PROTOINFO_TCP ─── CTA_PROTOINFO_TCP_STATE (1 byte)
//! CTA_COUNTERS_ORIG ─┬─ CTA_COUNTERS_PACKETS (8 bytes, BE)
//!                    └─ CTA_COUNTERS_BYTES   (8 bytes, BE)
//! ```
//!
//! Each level is a table from type code to handler, driven by
//! [`dispatch`]. Only the reply tuple is read; the original tuple describes
//! the same flow from the other side.
//!
//! Nothing below the top level can fail the message: a leaf with the wrong
//! width is skipped, and a nested list with broken framing is dropped with
//! a warning. Broken framing at the top level is returned to the caller.

use std::net::Ipv4Addr;

use tracing::{trace, warn};

use crate::connection::{Connection, tcp_state_name};
use crate::error::Result;
use crate::netlink::attributes::{Attribute, Handler, dispatch};
use crate::netlink::structures::*;

/// Top level: `enum ctattr_type`
const CONNECTION_ATTRS: &[(u16, Handler<Connection>)] = &[
    (CTA_TUPLE_REPLY, on_tuple),
    (CTA_STATUS, on_status),
    (CTA_PROTOINFO, on_protoinfo),
    (CTA_COUNTERS_ORIG, on_counters),
];

/// `enum ctattr_tuple`
const TUPLE_ATTRS: &[(u16, Handler<Connection>)] = &[
    (CTA_TUPLE_IP, on_tuple_ip),
    (CTA_TUPLE_PROTO, on_tuple_proto),
];

/// `enum ctattr_ip`
const IP_ATTRS: &[(u16, Handler<Connection>)] = &[
    (CTA_IP_V4_SRC, on_ipv4_src),
    (CTA_IP_V4_DST, on_ipv4_dst),
    (CTA_IP_V6_SRC, on_ipv6),
    (CTA_IP_V6_DST, on_ipv6),
];

/// `enum ctattr_l4proto`
const L4PROTO_ATTRS: &[(u16, Handler<Connection>)] = &[
    (CTA_PROTO_NUM, on_proto_num),
    (CTA_PROTO_SRC_PORT, on_src_port),
    (CTA_PROTO_DST_PORT, on_dst_port),
];

/// `enum ctattr_protoinfo`
const PROTOINFO_ATTRS: &[(u16, Handler<Connection>)] = &[(CTA_PROTOINFO_TCP, on_protoinfo_tcp)];

/// `enum ctattr_protoinfo_tcp`
const PROTOINFO_TCP_ATTRS: &[(u16, Handler<Connection>)] =
    &[(CTA_PROTOINFO_TCP_STATE, on_tcp_state)];

/// `enum ctattr_counters`
const COUNTER_ATTRS: &[(u16, Handler<Connection>)] = &[
    (CTA_COUNTERS_PACKETS, on_packets),
    (CTA_COUNTERS_BYTES, on_bytes),
];

/// Build a connection record from the attributes following the nfgenmsg header
///
/// The message type is left at its default; the dispatcher fills it in.
///
/// # Errors
///
/// Only a framing error in the top-level attribute list is reported.
pub fn build_connection(payload: &[u8]) -> Result<Connection> {
    let mut conn = Connection::default();
    dispatch(payload, CONNECTION_ATTRS, &mut conn)?;
    Ok(conn)
}

/// Recurse into a container attribute, absorbing its framing errors
fn descend(conn: &mut Connection, attr: &Attribute<'_>, table: &[(u16, Handler<Connection>)]) {
    if let Err(e) = dispatch(attr.payload, table, conn) {
        warn!(kind = attr.kind, error = %e, "ignoring malformed nested attribute");
    }
}

/// Payload as a fixed-width array, `None` (and a trace) on width mismatch
fn fixed<const N: usize>(attr: &Attribute<'_>) -> Option<[u8; N]> {
    let value = <[u8; N]>::try_from(attr.payload).ok();
    if value.is_none() {
        trace!(
            kind = attr.kind,
            expected = N,
            actual = attr.payload.len(),
            "unexpected attribute width"
        );
    }
    value
}

// === Top level ===

fn on_tuple(conn: &mut Connection, attr: &Attribute<'_>) {
    descend(conn, attr, TUPLE_ATTRS);
}

fn on_status(_conn: &mut Connection, attr: &Attribute<'_>) {
    // ip_conntrack_status bits, not used yet
    trace!(len = attr.payload.len(), "status attribute");
}

fn on_protoinfo(conn: &mut Connection, attr: &Attribute<'_>) {
    descend(conn, attr, PROTOINFO_ATTRS);
}

fn on_counters(conn: &mut Connection, attr: &Attribute<'_>) {
    descend(conn, attr, COUNTER_ATTRS);
}

// === Tuple ===

fn on_tuple_ip(conn: &mut Connection, attr: &Attribute<'_>) {
    descend(conn, attr, IP_ATTRS);
}

fn on_tuple_proto(conn: &mut Connection, attr: &Attribute<'_>) {
    descend(conn, attr, L4PROTO_ATTRS);
}

fn on_ipv4_src(conn: &mut Connection, attr: &Attribute<'_>) {
    if let Some(raw) = fixed::<4>(attr) {
        conn.src = Ipv4Addr::from(raw).into();
    }
}

fn on_ipv4_dst(conn: &mut Connection, attr: &Attribute<'_>) {
    if let Some(raw) = fixed::<4>(attr) {
        conn.dst = Ipv4Addr::from(raw).into();
    }
}

fn on_ipv6(_conn: &mut Connection, attr: &Attribute<'_>) {
    // IPv6 tuples are not decoded; the request only asks for AF_INET anyway
    trace!(kind = attr.kind, "ipv6 tuple address not decoded");
}

fn on_proto_num(conn: &mut Connection, attr: &Attribute<'_>) {
    if let Some([num]) = fixed::<1>(attr) {
        conn.proto = num;
    }
}

fn on_src_port(conn: &mut Connection, attr: &Attribute<'_>) {
    if let Some(raw) = fixed::<2>(attr) {
        conn.src_port = u16::from_be_bytes(raw);
    }
}

fn on_dst_port(conn: &mut Connection, attr: &Attribute<'_>) {
    if let Some(raw) = fixed::<2>(attr) {
        conn.dst_port = u16::from_be_bytes(raw);
    }
}

// === Protocol info ===

fn on_protoinfo_tcp(conn: &mut Connection, attr: &Attribute<'_>) {
    descend(conn, attr, PROTOINFO_TCP_ATTRS);
}

fn on_tcp_state(conn: &mut Connection, attr: &Attribute<'_>) {
    if let Some([code]) = fixed::<1>(attr) {
        conn.tcp_state = tcp_state_name(code);
    }
}

// === Counters ===

fn on_packets(conn: &mut Connection, attr: &Attribute<'_>) {
    if let Some(raw) = fixed::<8>(attr) {
        conn.packets = u64::from_be_bytes(raw);
    }
}

fn on_bytes(conn: &mut Connection, attr: &Attribute<'_>) {
    if let Some(raw) = fixed::<8>(attr) {
        conn.bytes = u64::from_be_bytes(raw);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::netlink::attributes::AttributeWriter;

    fn tuple(
        w: &mut AttributeWriter,
        kind: u16,
        src: [u8; 4],
        sport: u16,
        dst: [u8; 4],
        dport: u16,
    ) {
        w.nested(kind, |t| {
            t.nested(CTA_TUPLE_IP, |ip| {
                ip.put(CTA_IP_V4_SRC, &src).put(CTA_IP_V4_DST, &dst);
            });
            t.nested(CTA_TUPLE_PROTO, |p| {
                p.put_u8(CTA_PROTO_NUM, IPPROTO_TCP)
                    .put_u16_be(CTA_PROTO_SRC_PORT, sport)
                    .put_u16_be(CTA_PROTO_DST_PORT, dport);
            });
        });
    }

    fn tcp_state(w: &mut AttributeWriter, code: u8) {
        w.nested(CTA_PROTOINFO, |pi| {
            pi.nested(CTA_PROTOINFO_TCP, |tcp| {
                tcp.put_u8(CTA_PROTOINFO_TCP_STATE, code);
            });
        });
    }

    #[test]
    fn test_full_record() {
        let mut w = AttributeWriter::new();
        tuple(&mut w, CTA_TUPLE_ORIG, [1, 1, 1, 1], 1, [2, 2, 2, 2], 2);
        tuple(&mut w, CTA_TUPLE_REPLY, [10, 0, 0, 1], 42000, [93, 184, 216, 34], 443);
        w.put_u32_be(CTA_STATUS, 0x0e);
        tcp_state(&mut w, 3);
        w.nested(CTA_COUNTERS_ORIG, |c| {
            c.put_u64_be(CTA_COUNTERS_PACKETS, 10)
                .put_u64_be(CTA_COUNTERS_BYTES, 1000);
        });
        w.nested(CTA_COUNTERS_REPLY, |c| {
            c.put_u64_be(CTA_COUNTERS_PACKETS, 99);
        });

        let conn = build_connection(&w.finish()).unwrap();
        assert_eq!(conn.proto, IPPROTO_TCP);
        assert_eq!(conn.src, Address::from(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(conn.src_port, 42000);
        assert_eq!(conn.dst, Address::from(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(conn.dst_port, 443);
        assert_eq!(conn.tcp_state, "ESTABLISHED");
        assert_eq!(conn.packets, 10, "reply counters must not overwrite original ones");
        assert_eq!(conn.bytes, 1000);
    }

    #[test]
    fn test_original_tuple_ignored() {
        let mut w = AttributeWriter::new();
        tuple(&mut w, CTA_TUPLE_ORIG, [1, 1, 1, 1], 1, [2, 2, 2, 2], 2);

        let conn = build_connection(&w.finish()).unwrap();
        assert_eq!(conn, Connection::default());
    }

    #[test]
    fn test_empty_payload() {
        assert_eq!(build_connection(&[]).unwrap(), Connection::default());
    }

    #[test]
    fn test_wrong_width_skips_field_only() {
        let mut w = AttributeWriter::new();
        w.nested(CTA_TUPLE_REPLY, |t| {
            t.nested(CTA_TUPLE_PROTO, |p| {
                p.put_u8(CTA_PROTO_NUM, IPPROTO_TCP)
                    .put(CTA_PROTO_SRC_PORT, &[1, 2, 3])
                    .put_u16_be(CTA_PROTO_DST_PORT, 443);
            });
            t.nested(CTA_TUPLE_IP, |ip| {
                ip.put(CTA_IP_V4_SRC, &[10, 0, 0]);
            });
        });

        let conn = build_connection(&w.finish()).unwrap();
        assert_eq!(conn.proto, IPPROTO_TCP);
        assert_eq!(conn.src_port, 0);
        assert_eq!(conn.dst_port, 443);
        assert!(conn.src.is_empty());
    }

    #[test]
    fn test_ipv6_not_decoded() {
        let mut w = AttributeWriter::new();
        w.nested(CTA_TUPLE_REPLY, |t| {
            t.nested(CTA_TUPLE_IP, |ip| {
                ip.put(CTA_IP_V6_SRC, &[0xfe; 16]).put(CTA_IP_V6_DST, &[0xfd; 16]);
            });
        });

        let conn = build_connection(&w.finish()).unwrap();
        assert!(conn.src.is_empty());
        assert!(conn.dst.is_empty());
    }

    #[test]
    fn test_unknown_state_code() {
        let mut w = AttributeWriter::new();
        tcp_state(&mut w, 200);
        let conn = build_connection(&w.finish()).unwrap();
        assert_eq!(conn.tcp_state, "");
    }

    #[test]
    fn test_last_attribute_wins() {
        let mut w = AttributeWriter::new();
        tcp_state(&mut w, 1);
        tcp_state(&mut w, 7);
        let conn = build_connection(&w.finish()).unwrap();
        assert_eq!(conn.tcp_state, "TIME_WAIT");
    }

    #[test]
    fn test_broken_nested_list_is_contained() {
        let mut w = AttributeWriter::new();
        // Counters container whose single child claims 64 bytes
        let mut bogus = Vec::new();
        bogus.extend_from_slice(&64u16.to_ne_bytes());
        bogus.extend_from_slice(&CTA_COUNTERS_PACKETS.to_ne_bytes());
        w.put(CTA_COUNTERS_ORIG, &bogus);
        tcp_state(&mut w, 3);

        let conn = build_connection(&w.finish()).unwrap();
        assert_eq!(conn.packets, 0);
        assert_eq!(conn.tcp_state, "ESTABLISHED");
    }

    #[test]
    fn test_broken_top_level_fails() {
        let mut data = Vec::new();
        data.extend_from_slice(&100u16.to_ne_bytes());
        data.extend_from_slice(&CTA_STATUS.to_ne_bytes());
        assert!(build_connection(&data).unwrap_err().is_framing());
    }
}
