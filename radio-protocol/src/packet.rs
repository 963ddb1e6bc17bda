//! Audio packet structures and serialization
//!
//! Every audio datagram ("audiogram") carries a 128-bit (16-byte) header
//! followed by an opaque audio payload. The header holds two 64-bit fields in
//! network byte order: the sender's session id and the packet id, which is the
//! byte offset of the first audio byte of this packet within the stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Size of the audio packet header in bytes (2 fields × 8 bytes each)
pub const HEADER_SIZE: usize = 16;

/// Largest UDP payload we ever have to receive
pub const MAX_DATAGRAM_SIZE: usize = 65536;

/// Largest audio payload that still fits into a single IPv4 UDP datagram
pub const MAX_PAYLOAD_SIZE: usize = 65507 - HEADER_SIZE;

/// Audio packet header fields (each field is 64 bits / 8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeaderField {
    /// Session id chosen by the sender when the stream starts
    SessionId = 0,
    /// Byte offset of the first audio byte carried by the packet
    PacketId = 1,
}

impl HeaderField {
    /// Byte offset of this field inside the header
    pub fn offset(self) -> usize {
        self as usize * 8
    }
}

/// One framed unit of the audio stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    /// Session id; a higher value always supersedes a lower one
    pub session_id: u64,
    /// Byte offset of this packet's first audio byte
    pub packet_id: u64,
    /// Opaque audio bytes
    pub payload: Bytes,
}

impl AudioPacket {
    /// Create a new audio packet
    pub fn new(session_id: u64, packet_id: u64, payload: Bytes) -> Self {
        AudioPacket {
            session_id,
            packet_id,
            payload,
        }
    }

    /// Total size of the packet (header + payload)
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Number of audio bytes carried by the packet
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// Serialize the packet to bytes (network byte order)
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());
        buf.put_u64(self.session_id);
        buf.put_u64(self.packet_id);
        buf.put_slice(&self.payload);
        buf
    }

    /// Parse an audio packet from a received datagram
    ///
    /// A datagram must carry at least one payload byte; a bare header is not a
    /// valid audiogram because it cannot fix the stream's payload size.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() <= HEADER_SIZE {
            return Err(PacketError::InsufficientData {
                expected: HEADER_SIZE + 1,
                actual: bytes.len(),
            });
        }

        if bytes.len() - HEADER_SIZE > MAX_PAYLOAD_SIZE {
            return Err(PacketError::PayloadTooLarge {
                size: bytes.len() - HEADER_SIZE,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut header = &bytes[..HEADER_SIZE];
        let session_id = header.get_u64();
        let packet_id = header.get_u64();

        Ok(AudioPacket {
            session_id,
            packet_id,
            payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..]),
        })
    }
}

impl fmt::Display for AudioPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "audiogram(session={}, id={}, {} bytes)",
            self.session_id,
            self.packet_id,
            self.payload.len()
        )
    }
}

/// Packet parsing errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PacketError {
    #[error("Insufficient data: expected at least {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}
