//! Datagram decoding.
//!
//! A packet is UTF-8 text of the form `<tag><whitespace><json-object>`:
//!
//! ```text
//! p159 {"type":"ctx","id":"dev-1","key":"battery","value":87}
//! ```
//!
//! The tag `p<N>` carries a sender sequence number. It is decoded but not
//! used for loss or duplicate detection.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::attribute::{Attribute, FIELD_SESSION_ID};
use crate::error::{Error, Result};
use crate::limits::MAX_DATAGRAM_BYTES;

/// `<tag><ws><body>`; the body runs to the end of the (trimmed) packet.
static PACKET_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+)\s+(.+)$").expect("invalid packet pattern"));

/// Control token at the front of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketTag {
    /// `p<N>` payload sequence number.
    Sequence(u64),
    /// Any other token. Accepted and carried along.
    Other(String),
}

impl PacketTag {
    fn parse(token: &str) -> Self {
        token
            .strip_prefix('p')
            .and_then(|n| n.parse::<u64>().ok())
            .map(Self::Sequence)
            .unwrap_or_else(|| Self::Other(token.to_string()))
    }

    pub fn sequence(&self) -> Option<u64> {
        match self {
            Self::Sequence(n) => Some(*n),
            Self::Other(_) => None,
        }
    }
}

/// A successfully decoded datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    pub tag: PacketTag,
    /// The JSON object, minus any `sessionId` field.
    pub payload: Attribute,
    /// `sessionId` declared inside the payload, if any.
    pub session_id: Option<String>,
}

/// Stateless decoder for relay datagrams.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketDecoder;

impl PacketDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode one datagram.
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedPacket> {
        if bytes.len() > MAX_DATAGRAM_BYTES {
            return Err(Error::malformed(format!(
                "datagram of {} bytes exceeds {} byte limit",
                bytes.len(),
                MAX_DATAGRAM_BYTES
            )));
        }

        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::malformed(format!("not UTF-8: {}", e)))?;
        let text = text.trim_end_matches(['\n', '\r', '\t', ' ']);

        let captures = PACKET_REGEX
            .captures(text)
            .ok_or_else(|| Error::malformed("expected `<tag> <json>`"))?;

        let tag = PacketTag::parse(&captures[1]);
        let body: Value = serde_json::from_str(&captures[2])
            .map_err(|e| Error::malformed(format!("body is not JSON: {}", e)))?;

        let mut payload = Attribute::from_value(body)
            .map_err(|_| Error::malformed("body is not a JSON object"))?;
        let session_id = payload.take_str(FIELD_SESSION_ID);

        Ok(DecodedPacket {
            tag,
            payload,
            session_id,
        })
    }
}
