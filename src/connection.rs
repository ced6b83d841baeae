//! Decoded conntrack records and direction resolution
//!
//! A [`Connection`] is exactly what one ctnetlink message said: a tuple, a
//! TCP state and counters. Conntrack has no notion of "local" though. It
//! tracks forwarded and NATed flows too, and reports each flow in both
//! orientations (original and reply). [`Connection::conn_tcp`] picks a side
//! by looking the endpoints up in the set of addresses bound to this host.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use crate::address::Address;
use crate::netlink::structures::{
    IPCTNL_MSG_CT_DELETE, IPCTNL_MSG_CT_NEW, IPPROTO_TCP, NLM_F_CREATE, NLM_F_EXCL,
};

/// State name conntrack uses for a fully open TCP connection
pub const TCP_STATE_ESTABLISHED: &str = "ESTABLISHED";

/// Kernel `enum tcp_conntrack`, indexed by state code
const TCP_STATES: [&str; 14] = [
    "NONE",
    "SYN_SENT",
    "SYN_RECV",
    "ESTABLISHED",
    "FIN_WAIT",
    "CLOSE_WAIT",
    "LAST_ACK",
    "TIME_WAIT",
    "CLOSE",
    "SYN_SENT2",
    "MAX",
    "IGNORE",
    "RETRANS",
    "UNACK",
];

/// Human-readable name for a conntrack TCP state code
///
/// Codes the kernel may add in the future map to `""`.
pub fn tcp_state_name(code: u8) -> &'static str {
    TCP_STATES.get(usize::from(code)).copied().unwrap_or("")
}

/// What happened to the flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgType {
    /// First time the kernel reports this flow
    New,
    /// Existing flow, also used for every entry of a dump
    #[default]
    Update,
    /// Flow removed from the table
    Destroy,
}

impl MsgType {
    /// Classify a ctnetlink message from its code and header flags
    ///
    /// `IPCTNL_MSG_CT_NEW` is used both for fresh flows and for updates; the
    /// kernel sets `NLM_F_CREATE`/`NLM_F_EXCL` only on the former. Any other
    /// message code returns `None`.
    pub fn classify(msg_code: u8, flags: u16) -> Option<Self> {
        match msg_code {
            IPCTNL_MSG_CT_NEW if flags & (NLM_F_CREATE | NLM_F_EXCL) != 0 => Some(Self::New),
            IPCTNL_MSG_CT_NEW => Some(Self::Update),
            IPCTNL_MSG_CT_DELETE => Some(Self::Destroy),
            _ => None,
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::Update => "update",
            Self::Destroy => "destroy",
        })
    }
}

/// One decoded conntrack message
///
/// Fields start at their zero values and are filled as attributes are
/// seen; an attribute missing from the message leaves its field untouched.
/// The tuple is the *reply* direction one.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Connection {
    pub msg_type: MsgType,
    /// IP protocol number (6 for TCP)
    pub proto: u8,
    pub src: Address,
    pub src_port: u16,
    pub dst: Address,
    pub dst_port: u16,
    /// Name from the conntrack TCP state table, empty if not reported
    pub tcp_state: &'static str,
    pub packets: u64,
    pub bytes: u64,
}

impl Connection {
    pub fn is_tcp(&self) -> bool {
        self.proto == IPPROTO_TCP
    }

    pub fn is_established(&self) -> bool {
        self.tcp_state == TCP_STATE_ESTABLISHED
    }

    /// Decide which endpoint is ours
    ///
    /// Returns `None` for non-TCP records and for flows where neither
    /// endpoint is in `local` (forwarded or NATed traffic). When both are
    /// local, the endpoint with the lower port is taken as local, so the
    /// result does not depend on which side the kernel called "source".
    pub fn conn_tcp(&self, local: &HashSet<Address>) -> Option<ConnTCP> {
        if !self.is_tcp() {
            return None;
        }

        let mut src_local = local.contains(&self.src);
        let dst_local = local.contains(&self.dst);

        if src_local && dst_local {
            src_local = self.src_port < self.dst_port;
        }

        if src_local {
            Some(ConnTCP {
                local: self.src,
                local_port: self.src_port,
                remote: self.dst,
                remote_port: self.dst_port,
            })
        } else if dst_local {
            Some(ConnTCP {
                local: self.dst,
                local_port: self.dst_port,
                remote: self.src,
                remote_port: self.src_port,
            })
        } else {
            None
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}:{} -> {}:{} {} packets={} bytes={}",
            self.msg_type,
            self.src,
            self.src_port,
            self.dst,
            self.dst_port,
            self.tcp_state,
            self.packets,
            self.bytes
        )
    }
}

/// A TCP connection seen from this host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnTCP {
    pub local: Address,
    pub local_port: u16,
    pub remote: Address,
    pub remote_port: u16,
}

impl fmt::Display for ConnTCP {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.local, self.local_port, self.remote, self.remote_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(a: u8, b: u8, c: u8, d: u8) -> Address {
        Address::from(Ipv4Addr::new(a, b, c, d))
    }

    fn tcp(src: Address, src_port: u16, dst: Address, dst_port: u16) -> Connection {
        Connection {
            proto: IPPROTO_TCP,
            src,
            src_port,
            dst,
            dst_port,
            ..Connection::default()
        }
    }

    #[test]
    fn test_state_table() {
        assert_eq!(tcp_state_name(0), "NONE");
        assert_eq!(tcp_state_name(1), "SYN_SENT");
        assert_eq!(tcp_state_name(3), "ESTABLISHED");
        assert_eq!(tcp_state_name(7), "TIME_WAIT");
        assert_eq!(tcp_state_name(8), "CLOSE");
        assert_eq!(tcp_state_name(13), "UNACK");
        assert_eq!(tcp_state_name(14), "");
        assert_eq!(tcp_state_name(255), "");
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            MsgType::classify(IPCTNL_MSG_CT_NEW, NLM_F_CREATE | NLM_F_EXCL),
            Some(MsgType::New)
        );
        assert_eq!(MsgType::classify(IPCTNL_MSG_CT_NEW, NLM_F_CREATE), Some(MsgType::New));
        assert_eq!(MsgType::classify(IPCTNL_MSG_CT_NEW, 0), Some(MsgType::Update));
        assert_eq!(MsgType::classify(IPCTNL_MSG_CT_DELETE, 0), Some(MsgType::Destroy));
        assert_eq!(MsgType::classify(1, 0), None);
    }

    #[test]
    fn test_non_tcp_has_no_direction() {
        let local: HashSet<_> = [addr(10, 0, 0, 1)].into();
        let mut c = tcp(addr(10, 0, 0, 1), 5353, addr(224, 0, 0, 251), 5353);
        c.proto = 17;
        assert_eq!(c.conn_tcp(&local), None);
    }

    #[test]
    fn test_neither_local() {
        let local: HashSet<_> = [addr(10, 0, 0, 1)].into();
        let c = tcp(addr(192, 168, 0, 2), 40000, addr(8, 8, 8, 8), 53);
        assert_eq!(c.conn_tcp(&local), None);
    }

    #[test]
    fn test_src_local() {
        let local: HashSet<_> = [addr(10, 0, 0, 1)].into();
        let c = tcp(addr(10, 0, 0, 1), 42000, addr(93, 184, 216, 34), 443);
        let t = c.conn_tcp(&local).unwrap();
        assert_eq!(t.local, addr(10, 0, 0, 1));
        assert_eq!(t.local_port, 42000);
        assert_eq!(t.remote, addr(93, 184, 216, 34));
        assert_eq!(t.remote_port, 443);
    }

    #[test]
    fn test_dst_local() {
        let local: HashSet<_> = [addr(10, 0, 0, 1)].into();
        // Reply tuple of an inbound connection: we are the destination
        let c = tcp(addr(93, 184, 216, 34), 443, addr(10, 0, 0, 1), 42000);
        let t = c.conn_tcp(&local).unwrap();
        assert_eq!(t.local, addr(10, 0, 0, 1));
        assert_eq!(t.local_port, 42000);
        assert_eq!(t.remote_port, 443);
    }

    #[test]
    fn test_both_local_lower_port_wins() {
        let local: HashSet<_> = [addr(127, 0, 0, 1), addr(10, 0, 0, 1)].into();
        let a = tcp(addr(127, 0, 0, 1), 55000, addr(10, 0, 0, 1), 8080);
        let b = tcp(addr(10, 0, 0, 1), 8080, addr(127, 0, 0, 1), 55000);

        let ta = a.conn_tcp(&local).unwrap();
        let tb = b.conn_tcp(&local).unwrap();
        assert_eq!(ta, tb);
        assert_eq!(ta.local_port, 8080);
        assert_eq!(ta.local, addr(10, 0, 0, 1));
    }

    #[test]
    fn test_display() {
        let t = ConnTCP {
            local: addr(10, 0, 0, 1),
            local_port: 42000,
            remote: addr(93, 184, 216, 34),
            remote_port: 443,
        };
        assert_eq!(t.to_string(), "10.0.0.1:42000 -> 93.184.216.34:443");
        assert_eq!(MsgType::Destroy.to_string(), "destroy");
    }

    #[test]
    fn test_serialize() {
        let c = Connection {
            msg_type: MsgType::New,
            tcp_state: "SYN_SENT",
            ..tcp(addr(10, 0, 0, 1), 1, addr(10, 0, 0, 2), 2)
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["msg_type"], "new");
        assert_eq!(json["src"], "10.0.0.1");
        assert_eq!(json["tcp_state"], "SYN_SENT");
    }
}
