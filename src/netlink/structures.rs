//! Binary structures for the ctnetlink protocol
//!
//! Header fields are serialized explicitly at fixed offsets instead of
//! casting `repr(C)` structs to bytes. Netlink headers, the nfgenmsg header
//! and attribute headers all use host byte order; attribute *payloads*
//! (ports, counters) are big-endian and are handled by the record builder.

// NETLINK MESSAGE HEADER

/// Size of `struct nlmsghdr`
pub const NLMSG_HDRLEN: usize = 16;

/// Netlink message header (16 bytes)
///
/// ```text
/// 0        4      6      8        12       16
/// ┌────────┬──────┬──────┬────────┬────────┐
/// │  len   │ type │flags │  seq   │  pid   │
/// └────────┴──────┴──────┴────────┴────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NlMsgHdr {
    pub nlmsg_len: u32,
    pub nlmsg_type: u16,
    pub nlmsg_flags: u16,
    pub nlmsg_seq: u32,
    pub nlmsg_pid: u32,
}

impl NlMsgHdr {
    /// Serialize in host byte order
    pub fn to_bytes(&self) -> [u8; NLMSG_HDRLEN] {
        let mut out = [0u8; NLMSG_HDRLEN];
        out[0..4].copy_from_slice(&self.nlmsg_len.to_ne_bytes());
        out[4..6].copy_from_slice(&self.nlmsg_type.to_ne_bytes());
        out[6..8].copy_from_slice(&self.nlmsg_flags.to_ne_bytes());
        out[8..12].copy_from_slice(&self.nlmsg_seq.to_ne_bytes());
        out[12..16].copy_from_slice(&self.nlmsg_pid.to_ne_bytes());
        out
    }

    /// Read a header from the front of `data`
    ///
    /// Returns `None` if fewer than 16 bytes are available.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < NLMSG_HDRLEN {
            return None;
        }
        Some(Self {
            nlmsg_len: read_u32_ne(&data[0..4]),
            nlmsg_type: read_u16_ne(&data[4..6]),
            nlmsg_flags: read_u16_ne(&data[6..8]),
            nlmsg_seq: read_u32_ne(&data[8..12]),
            nlmsg_pid: read_u32_ne(&data[12..16]),
        })
    }
}

// NETFILTER GENERIC HEADER

/// Size of `struct nfgenmsg`
pub const NFGENMSG_LEN: usize = 4;

/// Netfilter generic header (4 bytes), first thing in every nfnetlink payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NfGenMsg {
    pub nfgen_family: u8,
    pub version: u8,
    pub res_id: u16,
}

impl NfGenMsg {
    pub fn to_bytes(&self) -> [u8; NFGENMSG_LEN] {
        let mut out = [0u8; NFGENMSG_LEN];
        out[0] = self.nfgen_family;
        out[1] = self.version;
        out[2..4].copy_from_slice(&self.res_id.to_ne_bytes());
        out
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < NFGENMSG_LEN {
            return None;
        }
        Some(Self {
            nfgen_family: data[0],
            version: data[1],
            res_id: read_u16_ne(&data[2..4]),
        })
    }
}

// ATTRIBUTE HEADER

/// Size of `struct nlattr`
pub const NLA_HDRLEN: usize = 4;

/// Payload is itself a list of attributes
pub const NLA_F_NESTED: u16 = 1 << 15;
/// Payload is in network byte order
pub const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
/// Bits of `nla_type` that carry the actual type code
pub const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

// CONSTANTS

// Netlink protocol family for nfnetlink
pub const NETLINK_NETFILTER: i32 = 12;

// Netlink message types
pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLMSG_OVERRUN: u16 = 4;
/// Types below this value are netlink control messages
pub const NLMSG_MIN_TYPE: u16 = 0x10;

// Netlink flags
pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_MULTI: u16 = 0x02;
pub const NLM_F_ACK: u16 = 0x04;

// GET request flags
pub const NLM_F_ROOT: u16 = 0x100;
pub const NLM_F_MATCH: u16 = 0x200;
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;

// NEW request flags (the kernel echoes these on conntrack events)
pub const NLM_F_EXCL: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;

// nfnetlink
pub const NFNETLINK_V0: u8 = 0;
pub const NFNL_SUBSYS_CTNETLINK: u8 = 1;

// ctnetlink message codes (lower byte of nlmsg_type)
pub const IPCTNL_MSG_CT_NEW: u8 = 0;
pub const IPCTNL_MSG_CT_GET: u8 = 1;
pub const IPCTNL_MSG_CT_DELETE: u8 = 2;

// Multicast groups (bind bitmask)
pub const NF_NETLINK_CONNTRACK_NEW: u32 = 0x0000_0001;
pub const NF_NETLINK_CONNTRACK_UPDATE: u32 = 0x0000_0002;
pub const NF_NETLINK_CONNTRACK_DESTROY: u32 = 0x0000_0004;
pub const NF_NETLINK_CONNTRACK_ALL: u32 =
    NF_NETLINK_CONNTRACK_NEW | NF_NETLINK_CONNTRACK_UPDATE | NF_NETLINK_CONNTRACK_DESTROY;

// Address families
pub const AF_INET: u8 = 2;
pub const AF_INET6: u8 = 10;

// Protocol numbers
pub const IPPROTO_TCP: u8 = 6;

// enum ctattr_type (top level)
pub const CTA_TUPLE_ORIG: u16 = 1;
pub const CTA_TUPLE_REPLY: u16 = 2;
pub const CTA_STATUS: u16 = 3;
pub const CTA_PROTOINFO: u16 = 4;
pub const CTA_COUNTERS_ORIG: u16 = 9;
pub const CTA_COUNTERS_REPLY: u16 = 10;

// enum ctattr_tuple
pub const CTA_TUPLE_IP: u16 = 1;
pub const CTA_TUPLE_PROTO: u16 = 2;

// enum ctattr_ip
pub const CTA_IP_V4_SRC: u16 = 1;
pub const CTA_IP_V4_DST: u16 = 2;
pub const CTA_IP_V6_SRC: u16 = 3;
pub const CTA_IP_V6_DST: u16 = 4;

// enum ctattr_l4proto
pub const CTA_PROTO_NUM: u16 = 1;
pub const CTA_PROTO_SRC_PORT: u16 = 2;
pub const CTA_PROTO_DST_PORT: u16 = 3;

// enum ctattr_protoinfo
pub const CTA_PROTOINFO_TCP: u16 = 1;

// enum ctattr_protoinfo_tcp
pub const CTA_PROTOINFO_TCP_STATE: u16 = 1;

// enum ctattr_counters
pub const CTA_COUNTERS_PACKETS: u16 = 1;
pub const CTA_COUNTERS_BYTES: u16 = 2;

// HELPER FUNCTIONS

/// Align length to 4-byte boundary
#[must_use]
pub const fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Align attribute length to 4-byte boundary
#[must_use]
pub const fn nla_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Pack subsystem and message code into `nlmsg_type`
#[must_use]
pub const fn nfnl_msg_type(subsys: u8, msg: u8) -> u16 {
    ((subsys as u16) << 8) | msg as u16
}

/// Subsystem id: upper byte of `nlmsg_type`
#[must_use]
pub const fn nfnl_subsys_id(msg_type: u16) -> u8 {
    (msg_type >> 8) as u8
}

/// Message code: lower byte of `nlmsg_type`
#[must_use]
pub const fn nfnl_msg_code(msg_type: u16) -> u8 {
    (msg_type & 0x00ff) as u8
}

fn read_u16_ne(b: &[u8]) -> u16 {
    u16::from_ne_bytes([b[0], b[1]])
}

fn read_u32_ne(b: &[u8]) -> u32 {
    u32::from_ne_bytes([b[0], b[1], b[2], b[3]])
}

// TESTS
