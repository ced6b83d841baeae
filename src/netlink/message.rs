//! Netlink message construction and dispatch
//!
//! This module builds the ctnetlink dump request and turns receive
//! buffers back into [`Connection`] records.
//!
//! # Message Format
//!
//! ```text
//! ┌─────────────────────────────┐
//! │ NlMsgHdr (16 bytes)         │  ← type = CTNETLINK << 8 | IPCTNL_MSG_CT_*
//! ├─────────────────────────────┤
//! │ NfGenMsg (4 bytes)          │  ← family, version, res_id
//! ├─────────────────────────────┤
//! │ Attributes (variable)       │  ← CTA_* tree, see `netlink::conntrack`
//! ├─────────────────────────────┤
//! │ Padding (0-3 bytes)         │
//! └─────────────────────────────┘
//! ```
//!
//! One `recv()` can return several of these back to back. A dump ends with
//! an `NLMSG_DONE` message; event subscriptions never end on their own.

use tracing::debug;

use crate::connection::{Connection, MsgType};
use crate::error::{ConntrackError, Result};
use crate::netlink::conntrack::build_connection;
use crate::netlink::structures::*;

// ============================================================================
// MESSAGE CONSTRUCTION
// ============================================================================

/// Build the request asking the kernel to dump its IPv4 conntrack table
///
/// ```text
/// ┌─────────────────────────────┐
/// │ NlMsgHdr (16 bytes)         │  len=20, type=0x0101, flags=REQUEST|DUMP
/// ├─────────────────────────────┤
/// │ NfGenMsg (4 bytes)          │  AF_INET, NFNETLINK_V0, res_id=0
/// └─────────────────────────────┘
/// ```
pub fn build_dump_request(seq: u32) -> Vec<u8> {
    let total = NLMSG_HDRLEN + NFGENMSG_LEN;

    let nlh = NlMsgHdr {
        nlmsg_len: total as u32,
        nlmsg_type: nfnl_msg_type(NFNL_SUBSYS_CTNETLINK, IPCTNL_MSG_CT_GET),
        nlmsg_flags: NLM_F_REQUEST | NLM_F_DUMP,
        nlmsg_seq: seq,
        nlmsg_pid: 0, // Kernel assigns
    };
    let nfgen = NfGenMsg {
        nfgen_family: AF_INET,
        version: NFNETLINK_V0,
        res_id: 0,
    };

    let mut buffer = Vec::with_capacity(nlmsg_align(total));
    buffer.extend_from_slice(&nlh.to_bytes());
    buffer.extend_from_slice(&nfgen.to_bytes());
    buffer.resize(nlmsg_align(total), 0);
    buffer
}

// ============================================================================
// MESSAGE SPLITTING
// ============================================================================

/// One netlink message borrowed from a receive buffer
#[derive(Debug, Clone, Copy)]
pub struct NetlinkMessage<'a> {
    pub header: NlMsgHdr,
    /// Everything after the 16-byte header, up to `nlmsg_len`
    pub payload: &'a [u8],
}

/// Iterator over the messages packed into one receive buffer
#[derive(Debug, Clone)]
pub struct MessageIter<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

/// Split a receive buffer into netlink messages
pub fn netlink_messages(data: &[u8]) -> MessageIter<'_> {
    MessageIter {
        data,
        offset: 0,
        failed: false,
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = Result<NetlinkMessage<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let remaining = &self.data[self.offset..];
        let header = NlMsgHdr::parse(remaining)?;
        let msg_len = header.nlmsg_len as usize;

        // === Validate message length ===
        //
        // A zero length would loop forever, an oversized one would read
        // past the datagram.
        if msg_len < NLMSG_HDRLEN || msg_len > remaining.len() {
            self.failed = true;
            return Some(Err(ConntrackError::framing(format!(
                "message length {} invalid (offset={}, buffer={})",
                msg_len,
                self.offset,
                self.data.len()
            ))));
        }

        let message = NetlinkMessage {
            header,
            payload: &remaining[NLMSG_HDRLEN..msg_len],
        };
        self.offset = (self.offset + nlmsg_align(msg_len)).min(self.data.len());
        Some(Ok(message))
    }
}

/// Read the errno carried by an `NLMSG_ERROR` payload
///
/// The kernel sends it negated; the returned value is positive, 0 for ACK.
pub fn parse_error_payload(payload: &[u8]) -> Result<i32> {
    let raw: [u8; 4] = payload
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| ConntrackError::framing("error message too small"))?;
    Ok(i32::from_ne_bytes(raw).wrapping_neg())
}

// ============================================================================
// DISPATCH
// ============================================================================

/// Outcome of dispatching one netlink message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// A decoded TCP connection record
    Connection(Connection),
    /// Nothing for the caller (ACK, NOOP, non-TCP record, unknown code)
    Skipped,
    /// `NLMSG_DONE`: the dump is complete
    Done,
}

/// Interpret one netlink message
///
/// # Errors
///
/// - `Kernel` for an `NLMSG_ERROR` with nonzero errno
/// - `Framing` for `NLMSG_OVERRUN`, a truncated nfgenmsg header or broken
///   top-level attribute framing
/// - `UnexpectedSubsystem` when the message is not from ctnetlink
pub fn dispatch_message(msg: &NetlinkMessage<'_>) -> Result<Dispatched> {
    let msg_type = msg.header.nlmsg_type;

    // === Netlink control messages ===
    match msg_type {
        NLMSG_DONE => return Ok(Dispatched::Done),
        NLMSG_ERROR => {
            let errno = parse_error_payload(msg.payload)?;
            if errno != 0 {
                return Err(ConntrackError::Kernel { errno });
            }
            // errno 0 is an ACK
            return Ok(Dispatched::Skipped);
        }
        NLMSG_NOOP => return Ok(Dispatched::Skipped),
        NLMSG_OVERRUN => return Err(ConntrackError::framing("kernel reported NLMSG_OVERRUN")),
        t if t < NLMSG_MIN_TYPE => {
            debug!(msg_type = t, "ignoring reserved netlink control message");
            return Ok(Dispatched::Skipped);
        }
        _ => {}
    }

    // === ctnetlink message ===
    let subsys = nfnl_subsys_id(msg_type);
    if subsys != NFNL_SUBSYS_CTNETLINK {
        return Err(ConntrackError::UnexpectedSubsystem(subsys));
    }

    let attrs = msg
        .payload
        .get(NFGENMSG_LEN..)
        .ok_or_else(|| ConntrackError::framing("payload shorter than nfgenmsg header"))?;

    let mut conn = build_connection(attrs)?;

    let code = nfnl_msg_code(msg_type);
    let Some(kind) = MsgType::classify(code, msg.header.nlmsg_flags) else {
        debug!(code, "ignoring ctnetlink message with unexpected code");
        return Ok(Dispatched::Skipped);
    };
    conn.msg_type = kind;

    if !conn.is_tcp() {
        debug!(proto = conn.proto, "skipping non-TCP conntrack entry");
        return Ok(Dispatched::Skipped);
    }

    Ok(Dispatched::Connection(conn))
}

/// Whether a receive buffer ended a dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// More messages may follow in later datagrams
    Continue,
    /// `NLMSG_DONE` was seen; anything after it was ignored
    Done,
}

/// Dispatch every message of one receive buffer, in order
///
/// Each TCP record is handed to `on_conn` before the next message is
/// decoded. Processing stops at the first error.
///
/// # Errors
///
/// Any framing or kernel error from [`netlink_messages`] or [`dispatch_message`].
pub fn dispatch_buffer(data: &[u8], mut on_conn: impl FnMut(Connection)) -> Result<BufferStatus> {
    for msg in netlink_messages(data) {
        match dispatch_message(&msg?)? {
            Dispatched::Connection(conn) => on_conn(conn),
            Dispatched::Skipped => {}
            Dispatched::Done => return Ok(BufferStatus::Done),
        }
    }
    Ok(BufferStatus::Continue)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::netlink::attributes::AttributeWriter;

    /// Wrap ctnetlink attributes into a complete netlink message
    pub(crate) fn ct_message(code: u8, flags: u16, attrs: &[u8]) -> Vec<u8> {
        let nfgen = NfGenMsg {
            nfgen_family: AF_INET,
            version: NFNETLINK_V0,
            res_id: 0,
        };
        let mut payload = nfgen.to_bytes().to_vec();
        payload.extend_from_slice(attrs);
        raw_message(nfnl_msg_type(NFNL_SUBSYS_CTNETLINK, code), flags, &payload)
    }

    pub(crate) fn raw_message(msg_type: u16, flags: u16, payload: &[u8]) -> Vec<u8> {
        let nlh = NlMsgHdr {
            nlmsg_len: (NLMSG_HDRLEN + payload.len()) as u32,
            nlmsg_type: msg_type,
            nlmsg_flags: flags,
            nlmsg_seq: 0,
            nlmsg_pid: 0,
        };
        let mut out = nlh.to_bytes().to_vec();
        out.extend_from_slice(payload);
        out.resize(nlmsg_align(out.len()), 0);
        out
    }

    pub(crate) fn done_message() -> Vec<u8> {
        raw_message(NLMSG_DONE, NLM_F_MULTI, &0i32.to_ne_bytes())
    }

    pub(crate) fn error_message(errno: i32) -> Vec<u8> {
        raw_message(NLMSG_ERROR, 0, &(-errno).to_ne_bytes())
    }

    /// Attributes of a TCP flow as the kernel reports its reply tuple
    pub(crate) fn tcp_flow(
        proto: u8,
        src: [u8; 4],
        sport: u16,
        dst: [u8; 4],
        dport: u16,
        state: u8,
    ) -> Vec<u8> {
        let mut w = AttributeWriter::new();
        w.nested(CTA_TUPLE_REPLY, |t| {
            t.nested(CTA_TUPLE_IP, |ip| {
                ip.put(CTA_IP_V4_SRC, &src).put(CTA_IP_V4_DST, &dst);
            });
            t.nested(CTA_TUPLE_PROTO, |p| {
                p.put_u8(CTA_PROTO_NUM, proto)
                    .put_u16_be(CTA_PROTO_SRC_PORT, sport)
                    .put_u16_be(CTA_PROTO_DST_PORT, dport);
            });
        });
        w.nested(CTA_PROTOINFO, |pi| {
            pi.nested(CTA_PROTOINFO_TCP, |tcp| {
                tcp.put_u8(CTA_PROTOINFO_TCP_STATE, state);
            });
        });
        w.nested(CTA_COUNTERS_ORIG, |c| {
            c.put_u64_be(CTA_COUNTERS_PACKETS, 10)
                .put_u64_be(CTA_COUNTERS_BYTES, 1000);
        });
        w.finish()
    }

    #[test]
    fn test_build_request() {
        let message = build_dump_request(12345);
        assert_eq!(message.len(), 20);

        let nlh = NlMsgHdr::parse(&message).unwrap();
        assert_eq!(nlh.nlmsg_len, 20);
        assert_eq!(nlh.nlmsg_type, 0x0101);
        assert_eq!(nlh.nlmsg_flags, NLM_F_REQUEST | NLM_F_DUMP);
        assert_eq!(nlh.nlmsg_seq, 12345);
        assert_eq!(nlh.nlmsg_pid, 0);

        let nfgen = NfGenMsg::parse(&message[NLMSG_HDRLEN..]).unwrap();
        assert_eq!(nfgen.nfgen_family, AF_INET);
        assert_eq!(nfgen.version, NFNETLINK_V0);
        assert_eq!(nfgen.res_id, 0);
    }

    #[test]
    fn test_split_multiple_messages() {
        let mut data = ct_message(IPCTNL_MSG_CT_NEW, 0, &[]);
        data.extend(raw_message(NLMSG_NOOP, 0, &[1, 2, 3]));
        data.extend(done_message());

        let msgs: Vec<_> = netlink_messages(&data).collect::<Result<_>>().unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[1].header.nlmsg_type, NLMSG_NOOP);
        assert_eq!(msgs[1].payload, &[1, 2, 3]);
        assert_eq!(msgs[2].header.nlmsg_type, NLMSG_DONE);
    }

    #[test]
    fn test_split_rejects_bad_length() {
        let mut data = done_message();
        data[0..4].copy_from_slice(&200u32.to_ne_bytes());
        assert!(netlink_messages(&data).next().unwrap().is_err());

        data[0..4].copy_from_slice(&4u32.to_ne_bytes());
        assert!(netlink_messages(&data).next().unwrap().is_err());
    }

    #[test]
    fn test_parse_error_payload() {
        assert_eq!(parse_error_payload(&0i32.to_ne_bytes()).unwrap(), 0);
        assert_eq!(parse_error_payload(&(-2i32).to_ne_bytes()).unwrap(), 2);
        assert!(parse_error_payload(&[0, 0]).is_err());
    }

    #[test]
    fn test_dispatch_new_update_destroy() {
        let attrs = tcp_flow(IPPROTO_TCP, [10, 0, 0, 1], 42000, [1, 1, 1, 1], 443, 3);

        let cases = [
            (IPCTNL_MSG_CT_NEW, NLM_F_CREATE | NLM_F_EXCL, MsgType::New),
            (IPCTNL_MSG_CT_NEW, 0, MsgType::Update),
            (IPCTNL_MSG_CT_DELETE, 0, MsgType::Destroy),
        ];
        for (code, flags, expected) in cases {
            let data = ct_message(code, flags, &attrs);
            let msg = netlink_messages(&data).next().unwrap().unwrap();
            match dispatch_message(&msg).unwrap() {
                Dispatched::Connection(c) => assert_eq!(c.msg_type, expected),
                other => panic!("expected connection, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_dispatch_skips_non_tcp() {
        let attrs = tcp_flow(17, [10, 0, 0, 1], 53, [1, 1, 1, 1], 53, 0);
        let data = ct_message(IPCTNL_MSG_CT_NEW, 0, &attrs);

        let mut seen = 0;
        let status = dispatch_buffer(&data, |_| seen += 1).unwrap();
        assert_eq!(seen, 0);
        assert_eq!(status, BufferStatus::Continue);
    }

    #[test]
    fn test_dispatch_kernel_error() {
        let data = error_message(libc::EPERM);
        let mut seen = 0;
        let err = dispatch_buffer(&data, |_| seen += 1).unwrap_err();
        assert!(matches!(err, ConntrackError::Kernel { errno } if errno == libc::EPERM));
        assert!(err.is_framing());
        assert_eq!(seen, 0);
    }

    #[test]
    fn test_dispatch_ack_is_skipped() {
        let data = error_message(0);
        assert_eq!(dispatch_buffer(&data, |_| {}).unwrap(), BufferStatus::Continue);
    }

    #[test]
    fn test_dispatch_wrong_subsystem() {
        // NFNL_SUBSYS_CTNETLINK_EXP = 2
        let data = raw_message(nfnl_msg_type(2, 0), 0, &[2, 0, 0, 0]);
        let err = dispatch_buffer(&data, |_| {}).unwrap_err();
        assert!(matches!(err, ConntrackError::UnexpectedSubsystem(2)));
    }

    #[test]
    fn test_dispatch_truncated_nfgenmsg() {
        let data = raw_message(nfnl_msg_type(NFNL_SUBSYS_CTNETLINK, 0), 0, &[2, 0]);
        assert!(dispatch_buffer(&data, |_| {}).unwrap_err().is_framing());
    }

    #[test]
    fn test_done_stops_buffer() {
        let attrs = tcp_flow(IPPROTO_TCP, [10, 0, 0, 1], 1000, [10, 0, 0, 2], 22, 3);
        let mut data = ct_message(IPCTNL_MSG_CT_NEW, NLM_F_MULTI, &attrs);
        data.extend(done_message());
        data.extend(ct_message(IPCTNL_MSG_CT_NEW, NLM_F_MULTI, &attrs));

        let mut seen = Vec::new();
        let status = dispatch_buffer(&data, |c| seen.push(c)).unwrap();
        assert_eq!(status, BufferStatus::Done);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].msg_type, MsgType::Update);
        assert_eq!(seen[0].dst_port, 22);
    }

    #[test]
    fn test_order_preserved() {
        let mut data = Vec::new();
        for port in [5000u16, 5001, 5002] {
            let attrs = tcp_flow(IPPROTO_TCP, [10, 0, 0, 1], port, [10, 0, 0, 2], 80, 3);
            data.extend(ct_message(IPCTNL_MSG_CT_NEW, 0, &attrs));
        }
        let mut ports = Vec::new();
        dispatch_buffer(&data, |c| ports.push(c.src_port)).unwrap();
        assert_eq!(ports, vec![5000, 5001, 5002]);
    }
}
