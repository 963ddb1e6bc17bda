//! Control message generation and parsing
//!
//! Control traffic is plain ASCII over UDP:
//!
//! - `ZERO_SEVEN_COME_IN\n` - discovery lookup, broadcast by receivers
//! - `BOREWICZ_HERE <mcast addr> <data port> <name>\n` - discovery reply
//! - `LOUDER_PLEASE <id>,<id>,...\n` - retransmission request
//!
//! The first character of the lookup and the repair request differ, so a
//! single byte is enough to route an inbound message.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str;
use thiserror::Error;

/// Discovery lookup, sent verbatim
pub const LOOKUP_MSG: &str = "ZERO_SEVEN_COME_IN\n";

/// Prefix of a discovery reply
pub const REPLY_PREFIX: &str = "BOREWICZ_HERE";

/// Prefix of a retransmission request (includes the separating space)
pub const REXMIT_PREFIX: &str = "LOUDER_PLEASE ";

/// Maximum length of a station name in bytes
pub const MAX_NAME_LEN: usize = 64;

/// Maximum length of a discovery control message
pub const MAX_CTRL_MSG_LEN: usize = 128;

/// Largest retransmission request we put into one datagram
pub const MAX_REXMIT_MSG_LEN: usize = 65507;

/// Control message parse errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ControlError {
    #[error("Empty control message")]
    Empty,

    #[error("Unknown control message")]
    UnknownMessage,

    #[error("Control message is not valid ASCII text")]
    NotText,

    #[error("Malformed lookup message")]
    MalformedLookup,

    #[error("Malformed reply: {0}")]
    MalformedReply(&'static str),

    #[error("Station name too long: {len} bytes (max {max})")]
    NameTooLong { len: usize, max: usize },
}

/// Station identity announced in a discovery reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationAnnouncement {
    /// Multicast group and port the station streams to
    pub data_addr: SocketAddrV4,
    /// Station name (at most 64 bytes)
    pub name: String,
}

impl StationAnnouncement {
    /// Create a new announcement, validating the name length
    pub fn new(data_addr: SocketAddrV4, name: impl Into<String>) -> Result<Self, ControlError> {
        let name = name.into();
        if name.len() > MAX_NAME_LEN {
            return Err(ControlError::NameTooLong {
                len: name.len(),
                max: MAX_NAME_LEN,
            });
        }
        Ok(StationAnnouncement { data_addr, name })
    }

    fn parse(body: &str) -> Result<Self, ControlError> {
        let mut fields = body.splitn(3, ' ');

        let addr: Ipv4Addr = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(ControlError::MalformedReply("bad multicast address"))?;
        if !addr.is_multicast() {
            return Err(ControlError::MalformedReply("address is not multicast"));
        }

        let port: u16 = fields
            .next()
            .and_then(|s| s.parse().ok())
            .filter(|&p| p != 0)
            .ok_or(ControlError::MalformedReply("bad data port"))?;

        let name = fields
            .next()
            .filter(|n| !n.is_empty())
            .ok_or(ControlError::MalformedReply("missing station name"))?;

        StationAnnouncement::new(SocketAddrV4::new(addr, port), name)
    }
}

/// Retransmission request: packet ids the receiver is missing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RexmitRequest {
    /// Requested packet ids (byte offsets), in message order
    pub ids: Vec<u64>,
    /// Number of tokens that were not valid packet ids
    pub skipped: usize,
}

impl RexmitRequest {
    /// Create a request for the given ids
    pub fn new(ids: Vec<u64>) -> Self {
        RexmitRequest { ids, skipped: 0 }
    }

    /// Parse the comma separated id list following the prefix
    ///
    /// Tokens that are not unsigned decimal 64-bit numbers are skipped; the
    /// other ids of the same message are still returned.
    pub fn parse_ids(list: &str) -> Self {
        let mut request = RexmitRequest::default();

        for token in list.split(',') {
            let token = token.trim_matches(|c| c == ' ' || c == '\r');
            let parsed = if token.bytes().all(|b| b.is_ascii_digit()) {
                token.parse::<u64>().ok()
            } else {
                None
            };
            match parsed {
                Some(id) => request.ids.push(id),
                None => request.skipped += 1,
            }
        }

        request
    }

    /// Encode the ids into one or more datagrams, none longer than `max_len`
    ///
    /// Every datagram is a complete request on its own. An empty id list
    /// encodes to nothing.
    pub fn encode_batched(ids: &[u64], max_len: usize) -> Vec<Bytes> {
        let mut datagrams = Vec::new();
        let mut current = BytesMut::new();

        for id in ids {
            let token = id.to_string();
            // prefix + token + '\n' must always fit, otherwise nothing ever will
            let needed = if current.is_empty() {
                REXMIT_PREFIX.len() + token.len() + 1
            } else {
                current.len() + 1 + token.len() + 1
            };

            if !current.is_empty() && needed > max_len {
                current.put_u8(b'\n');
                datagrams.push(std::mem::take(&mut current).freeze());
            }

            if current.is_empty() {
                current.put_slice(REXMIT_PREFIX.as_bytes());
            } else {
                current.put_u8(b',');
            }
            current.put_slice(token.as_bytes());
        }

        if !current.is_empty() {
            current.put_u8(b'\n');
            datagrams.push(current.freeze());
        }

        datagrams
    }
}

/// Any control message exchanged on the control ports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Discovery lookup
    Lookup,
    /// Discovery reply
    Reply(StationAnnouncement),
    /// Retransmission request
    Rexmit(RexmitRequest),
}

impl ControlMessage {
    /// Parse a control message from a received datagram
    pub fn parse(bytes: &[u8]) -> Result<Self, ControlError> {
        let first = *bytes.first().ok_or(ControlError::Empty)?;

        if first == LOOKUP_MSG.as_bytes()[0] {
            if bytes == LOOKUP_MSG.as_bytes() {
                return Ok(ControlMessage::Lookup);
            }
            return Err(ControlError::MalformedLookup);
        }

        let text = str::from_utf8(bytes).map_err(|_| ControlError::NotText)?;

        if let Some(list) = text.strip_prefix(REXMIT_PREFIX) {
            let list = list.strip_suffix('\n').unwrap_or(list);
            return Ok(ControlMessage::Rexmit(RexmitRequest::parse_ids(list)));
        }

        if let Some(rest) = text.strip_prefix(REPLY_PREFIX) {
            let body = rest
                .strip_prefix(' ')
                .ok_or(ControlError::MalformedReply("missing separator"))?;
            let body = body.strip_suffix('\n').unwrap_or(body);
            return Ok(ControlMessage::Reply(StationAnnouncement::parse(body)?));
        }

        Err(ControlError::UnknownMessage)
    }

    /// Serialize the message
    ///
    /// Retransmission requests are rendered as a single datagram here; use
    /// [`RexmitRequest::encode_batched`] when the id list may be long.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            ControlMessage::Lookup => Bytes::from_static(LOOKUP_MSG.as_bytes()),
            ControlMessage::Reply(announcement) => Bytes::from(format!(
                "{} {} {} {}\n",
                REPLY_PREFIX,
                announcement.data_addr.ip(),
                announcement.data_addr.port(),
                announcement.name
            )),
            ControlMessage::Rexmit(request) => {
                let ids: Vec<String> = request.ids.iter().map(u64::to_string).collect();
                Bytes::from(format!("{}{}\n", REXMIT_PREFIX, ids.join(",")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> SocketAddrV4 {
        "239.10.11.12:25826".parse().unwrap()
    }

    #[test]
    fn test_lookup() {
        assert_eq!(
            ControlMessage::parse(b"ZERO_SEVEN_COME_IN\n").unwrap(),
            ControlMessage::Lookup
        );
        assert_eq!(ControlMessage::Lookup.to_bytes().len(), 19);
        assert_eq!(
            ControlMessage::parse(b"ZERO_SEVEN_COME_IN"),
            Err(ControlError::MalformedLookup)
        );
        assert_eq!(
            ControlMessage::parse(b"ZERO_SEVEN_COME_IN\nextra"),
            Err(ControlError::MalformedLookup)
        );
    }

    #[test]
    fn test_reply_format() {
        let announcement = StationAnnouncement::new(group(), "Radio Zet").unwrap();
        let bytes = ControlMessage::Reply(announcement.clone()).to_bytes();

        assert_eq!(&bytes[..], b"BOREWICZ_HERE 239.10.11.12 25826 Radio Zet\n");
        assert_eq!(
            ControlMessage::parse(&bytes).unwrap(),
            ControlMessage::Reply(announcement)
        );
    }

    #[test]
    fn test_reply_rejects_bad_fields() {
        assert!(ControlMessage::parse(b"BOREWICZ_HERE 10.0.0.1 25826 A\n").is_err());
        assert!(ControlMessage::parse(b"BOREWICZ_HERE 239.0.0.1 0 A\n").is_err());
        assert!(ControlMessage::parse(b"BOREWICZ_HERE 239.0.0.1 70000 A\n").is_err());
        assert!(ControlMessage::parse(b"BOREWICZ_HERE 239.0.0.1 25826\n").is_err());
        assert!(ControlMessage::parse(b"BOREWICZ_HERE 239.0.0.1 25826 \n").is_err());
        assert!(ControlMessage::parse(b"BOREWICZ_HERE239.0.0.1 25826 A\n").is_err());
    }

    #[test]
    fn test_reply_name_length_limit() {
        let ok = format!("BOREWICZ_HERE 239.0.0.1 25826 {}\n", "n".repeat(MAX_NAME_LEN));
        assert!(ControlMessage::parse(ok.as_bytes()).is_ok());

        let long = format!("BOREWICZ_HERE 239.0.0.1 25826 {}\n", "n".repeat(MAX_NAME_LEN + 1));
        assert_eq!(
            ControlMessage::parse(long.as_bytes()),
            Err(ControlError::NameTooLong {
                len: MAX_NAME_LEN + 1,
                max: MAX_NAME_LEN
            })
        );
    }

    #[test]
    fn test_rexmit_parse() {
        let parsed = ControlMessage::parse(b"LOUDER_PLEASE 200,712,1224\n").unwrap();
        assert_eq!(
            parsed,
            ControlMessage::Rexmit(RexmitRequest::new(vec![200, 712, 1224]))
        );
    }

    #[test]
    fn test_rexmit_skips_bad_tokens() {
        let parsed = ControlMessage::parse(b"LOUDER_PLEASE 100,-5,abc,,300,18446744073709551616\n");
        match parsed.unwrap() {
            ControlMessage::Rexmit(request) => {
                assert_eq!(request.ids, vec![100, 300]);
                assert_eq!(request.skipped, 4);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_rexmit_wrong_prefix_rejected() {
        assert_eq!(
            ControlMessage::parse(b"LOUDER_PLEASE100\n"),
            Err(ControlError::UnknownMessage)
        );
        assert_eq!(
            ControlMessage::parse(b"louder_please 100\n"),
            Err(ControlError::UnknownMessage)
        );
    }

    #[test]
    fn test_rexmit_encoding() {
        let bytes = ControlMessage::Rexmit(RexmitRequest::new(vec![200])).to_bytes();
        assert_eq!(&bytes[..], b"LOUDER_PLEASE 200\n");

        let batched = RexmitRequest::encode_batched(&[0, 512, 1024], MAX_REXMIT_MSG_LEN);
        assert_eq!(batched.len(), 1);
        assert_eq!(&batched[0][..], b"LOUDER_PLEASE 0,512,1024\n");

        assert!(RexmitRequest::encode_batched(&[], MAX_REXMIT_MSG_LEN).is_empty());
    }

    #[test]
    fn test_rexmit_encoding_splits_long_lists() {
        let ids: Vec<u64> = (0..100).map(|i| i * 1000).collect();
        let batched = RexmitRequest::encode_batched(&ids, 64);

        assert!(batched.len() > 1);

        let mut decoded = Vec::new();
        for datagram in &batched {
            assert!(datagram.len() <= 64);
            match ControlMessage::parse(datagram).unwrap() {
                ControlMessage::Rexmit(request) => {
                    assert_eq!(request.skipped, 0);
                    decoded.extend(request.ids);
                }
                other => panic!("unexpected message {:?}", other),
            }
        }
        assert_eq!(decoded, ids);
    }

    #[test]
    fn test_unknown_and_empty() {
        assert_eq!(ControlMessage::parse(b""), Err(ControlError::Empty));
        assert_eq!(
            ControlMessage::parse(b"HELLO\n"),
            Err(ControlError::UnknownMessage)
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_parse_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..160)) {
                let _ = ControlMessage::parse(&bytes);
            }

            #[test]
            fn prop_reply_survives_the_wire(
                ip in any::<u8>(),
                port in 1u16..=u16::MAX,
                name in "[ -~]{1,64}",
            ) {
                let data_addr = SocketAddrV4::new(Ipv4Addr::new(239, 0, 0, ip), port);
                let announcement = StationAnnouncement::new(data_addr, name.clone()).unwrap();
                let bytes = ControlMessage::Reply(announcement).to_bytes();

                prop_assert!(bytes.len() <= MAX_CTRL_MSG_LEN);
                match ControlMessage::parse(&bytes).unwrap() {
                    ControlMessage::Reply(parsed) => {
                        prop_assert_eq!(parsed.data_addr, data_addr);
                        prop_assert_eq!(parsed.name, name);
                    }
                    other => return Err(TestCaseError::fail(format!("expected a reply, got {:?}", other))),
                }
            }
        }
    }
}
