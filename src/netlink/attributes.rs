//! Netlink attribute (TLV) decoding and encoding
//!
//! Every ctnetlink payload after the nfgenmsg header is a list of
//! attributes, and many attributes contain further attribute lists.
//!
//! # Attribute Format
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────┬─────────┐
//! │ nla_len: u16 │ nla_type: u16│ payload          │ padding │
//! └──────────────┴──────────────┴──────────────────┴─────────┘
//!   includes the     bit 15: nested                 to 4-byte
//!   4-byte header    bit 14: net byte order         boundary
//!                    bits 0-13: type code
//! ```
//!
//! The decoder here knows nothing about conntrack. It yields one level at
//! a time; the caller decides which type codes are containers and recurses
//! by decoding the payload again. [`dispatch`] adds the tagged-dispatch
//! layer on top: a per-level table from type code to handler.
//!
//! ## Termination
//!
//! - Fewer than 4 bytes left: normal end of the list (trailing padding).
//! - Declared length smaller than the header or larger than what is left:
//!   framing error for this level. The iterator yields the error once and
//!   then stops.

use tracing::trace;

use crate::error::{ConntrackError, Result};
use crate::netlink::structures::{
    NLA_F_NESTED, NLA_F_NET_BYTEORDER, NLA_HDRLEN, NLA_TYPE_MASK, nla_align,
};

/// One decoded attribute, borrowing its payload from the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute<'a> {
    /// Type code with the flag bits masked off
    pub kind: u16,
    /// `NLA_F_NESTED` was set
    pub nested: bool,
    /// `NLA_F_NET_BYTEORDER` was set (informational only)
    pub net_byteorder: bool,
    /// Payload without header or padding
    pub payload: &'a [u8],
}

/// Lazy iterator over the attributes of one nesting level
#[derive(Debug, Clone)]
pub struct AttributeIter<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

/// Decode the attribute list in `data`
pub fn attributes(data: &[u8]) -> AttributeIter<'_> {
    AttributeIter {
        data,
        offset: 0,
        failed: false,
    }
}

impl<'a> Iterator for AttributeIter<'a> {
    type Item = Result<Attribute<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let remaining = &self.data[self.offset..];
        if remaining.len() < NLA_HDRLEN {
            return None;
        }

        let attr_len = usize::from(u16::from_ne_bytes([remaining[0], remaining[1]]));
        let raw_type = u16::from_ne_bytes([remaining[2], remaining[3]]);

        if attr_len < NLA_HDRLEN || attr_len > remaining.len() {
            self.failed = true;
            return Some(Err(ConntrackError::framing(format!(
                "attribute length {} invalid (offset={}, remaining={})",
                attr_len,
                self.offset,
                remaining.len()
            ))));
        }

        let attr = Attribute {
            kind: raw_type & NLA_TYPE_MASK,
            nested: raw_type & NLA_F_NESTED != 0,
            net_byteorder: raw_type & NLA_F_NET_BYTEORDER != 0,
            payload: &remaining[NLA_HDRLEN..attr_len],
        };

        // The last attribute of a list may omit its padding
        self.offset = (self.offset + nla_align(attr_len)).min(self.data.len());

        Some(Ok(attr))
    }
}

// ============================================================================
// TAGGED DISPATCH
// ============================================================================

/// Handler for one attribute type at one nesting level
pub type Handler<T> = fn(&mut T, &Attribute<'_>);

/// Walk one attribute level, routing each attribute through `table`
///
/// Type codes missing from the table are skipped. If the same type code
/// appears twice, its handler runs twice and the later value wins.
///
/// # Errors
///
/// Returns the framing error of this level. Attributes already handled
/// before the bad header keep their effect on `target`.
pub fn dispatch<T>(data: &[u8], table: &[(u16, Handler<T>)], target: &mut T) -> Result<()> {
    for attr in attributes(data) {
        let attr = attr?;
        match table.iter().find(|(kind, _)| *kind == attr.kind) {
            Some((_, handler)) => handler(target, &attr),
            None => trace!(kind = attr.kind, len = attr.payload.len(), "skipping attribute"),
        }
    }
    Ok(())
}

// ============================================================================
// ENCODING
// ============================================================================

/// Builds attribute lists in the same wire format the kernel emits
///
/// Used for tests and for any request that needs to carry attributes.
///
/// ```
/// use conntrack::netlink::attributes::{AttributeWriter, attributes};
///
/// let mut w = AttributeWriter::new();
/// w.nested(2, |tuple| {
///     tuple.put_u16_be(3, 443);
/// });
/// let bytes = w.finish();
///
/// let outer = attributes(&bytes).next().unwrap().unwrap();
/// assert!(outer.nested);
/// let inner = attributes(outer.payload).next().unwrap().unwrap();
/// assert_eq!(inner.payload, &443u16.to_be_bytes());
/// ```
#[derive(Debug, Default, Clone)]
pub struct AttributeWriter {
    buf: Vec<u8>,
}

impl AttributeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a leaf attribute with raw payload bytes
    ///
    /// # Panics
    ///
    /// Panics if the payload does not fit a 16-bit attribute length.
    pub fn put(&mut self, kind: u16, payload: &[u8]) -> &mut Self {
        self.put_raw(kind & NLA_TYPE_MASK, payload)
    }

    pub fn put_u8(&mut self, kind: u16, value: u8) -> &mut Self {
        self.put(kind, &[value])
    }

    pub fn put_u16_be(&mut self, kind: u16, value: u16) -> &mut Self {
        self.put_raw((kind & NLA_TYPE_MASK) | NLA_F_NET_BYTEORDER, &value.to_be_bytes())
    }

    pub fn put_u32_be(&mut self, kind: u16, value: u32) -> &mut Self {
        self.put_raw((kind & NLA_TYPE_MASK) | NLA_F_NET_BYTEORDER, &value.to_be_bytes())
    }

    pub fn put_u64_be(&mut self, kind: u16, value: u64) -> &mut Self {
        self.put_raw((kind & NLA_TYPE_MASK) | NLA_F_NET_BYTEORDER, &value.to_be_bytes())
    }

    /// Append a container attribute whose payload is built by `build`
    pub fn nested(&mut self, kind: u16, build: impl FnOnce(&mut AttributeWriter)) -> &mut Self {
        let mut inner = AttributeWriter::new();
        build(&mut inner);
        self.put_raw((kind & NLA_TYPE_MASK) | NLA_F_NESTED, &inner.buf)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn put_raw(&mut self, raw_type: u16, payload: &[u8]) -> &mut Self {
        let len = u16::try_from(NLA_HDRLEN + payload.len())
            .unwrap_or_else(|_| panic!("attribute payload of {} bytes too large", payload.len()));
        self.buf.extend_from_slice(&len.to_ne_bytes());
        self.buf.extend_from_slice(&raw_type.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.resize(nla_align(self.buf.len()), 0);
        self
    }
}

// ============================================================================
// TESTS
// ============================================================================
