//! Circular playback buffer with gap detection
//!
//! The receiver stores audio packets in a fixed array of slots indexed by
//! packet id. Slot `i` holds the packet whose id is
//! `start_id + payload_size * (i + k * capacity)` for some lap `k`. A slot is
//! fresh between being written and being played; a slot that is due for
//! playback but not fresh means the audio for it never arrived.

use crate::loss::GapRange;
use crate::packet::AudioPacket;
use bytes::Bytes;
use thiserror::Error;

/// Faults that end the current playback session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DesyncError {
    #[error("Session {current} superseded by session {incoming}")]
    SessionSuperseded { current: u64, incoming: u64 },

    #[error("Packet {packet_id} is {lead} slots ahead of playback (max {max_lead})")]
    TooFarAhead {
        packet_id: u64,
        lead: u64,
        max_lead: usize,
    },

    #[error("Packet {packet_id} missing when due for playback")]
    StaleSlot { packet_id: u64 },
}

/// Why a packet was dropped without touching the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Datagram could not be decoded, or its id leaves no room in the id space
    Malformed,
    /// Packet belongs to an older session
    OlderSession,
    /// Packet was already played or precedes the stream start
    AlreadyPlayed,
    /// Packet id is not aligned to the payload size
    Misaligned,
    /// Payload length differs from the session's payload size
    PayloadSizeMismatch,
}

/// Outcome of storing a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// Packet stored, no new gap
    Stored,
    /// Packet stored after a forward jump; the range was marked missing
    Gap(GapRange),
    /// Packet dropped
    Ignored(IgnoreReason),
}

/// One buffer slot
#[derive(Clone, Default)]
struct Slot {
    packet_id: u64,
    payload: Bytes,
    fresh: bool,
}

/// Fixed-capacity circular buffer of audio packets
pub struct PlaybackBuffer {
    /// Slot storage (circular)
    slots: Vec<Slot>,
    /// Number of slots
    capacity: usize,
    /// Audio bytes per packet, fixed by the first packet
    payload_size: u64,
    /// Session being played
    session_id: u64,
    /// Packet id of the first packet of the session
    start_id: u64,
    /// Highest packet id stored so far
    max_seen: u64,
    /// Absolute slot number of the next packet to play
    next_play: u64,
    /// Packets this many slots ahead of playback are rejected
    max_lead: usize,
}

impl PlaybackBuffer {
    /// Start a buffer from the first packet of a session
    ///
    /// The payload size is taken from the packet; capacity is
    /// `buffer_bytes / payload_size` slots, at least one. `max_lead` is
    /// clamped to the capacity.
    /// Returns `None` when the id space above the first packet cannot hold a
    /// full buffer.
    pub fn start(
        first: AudioPacket,
        buffer_bytes: usize,
        max_lead: Option<usize>,
    ) -> Option<Self> {
        if !Self::fits(&first, buffer_bytes) {
            return None;
        }
        let payload_size = first.payload.len().max(1);
        let capacity = Self::capacity_for(buffer_bytes, payload_size);
        let max_lead = max_lead.unwrap_or(capacity).clamp(1, capacity);

        let mut slots = vec![Slot::default(); capacity];
        slots[0] = Slot {
            packet_id: first.packet_id,
            payload: first.payload,
            fresh: true,
        };

        Some(PlaybackBuffer {
            slots,
            capacity,
            payload_size: payload_size as u64,
            session_id: first.session_id,
            start_id: first.packet_id,
            max_seen: first.packet_id,
            next_play: 0,
            max_lead,
        })
    }

    /// Whether a session starting at `first` keeps every id of a full buffer
    /// within `u64`
    pub fn fits(first: &AudioPacket, buffer_bytes: usize) -> bool {
        let payload_size = first.payload.len().max(1);
        let capacity = Self::capacity_for(buffer_bytes, payload_size);
        (payload_size as u64)
            .checked_mul(capacity as u64)
            .and_then(|span| first.packet_id.checked_add(span))
            .is_some()
    }

    fn capacity_for(buffer_bytes: usize, payload_size: usize) -> usize {
        (buffer_bytes / payload_size).max(1)
    }

    /// Absolute slot number for an aligned packet id
    #[inline]
    fn slot_number(&self, packet_id: u64) -> u64 {
        (packet_id - self.start_id) / self.payload_size
    }

    /// Get the index in the slot array for an absolute slot number
    #[inline]
    fn index(&self, slot_number: u64) -> usize {
        (slot_number % self.capacity as u64) as usize
    }

    /// Store a received packet, detecting gaps
    pub fn insert(&mut self, packet: AudioPacket) -> Result<Insert, DesyncError> {
        if packet.session_id < self.session_id {
            return Ok(Insert::Ignored(IgnoreReason::OlderSession));
        }
        if packet.session_id > self.session_id {
            return Err(DesyncError::SessionSuperseded {
                current: self.session_id,
                incoming: packet.session_id,
            });
        }

        if packet.payload.len() as u64 != self.payload_size {
            return Ok(Insert::Ignored(IgnoreReason::PayloadSizeMismatch));
        }

        let packet_id = packet.packet_id;
        if packet_id < self.start_id {
            return Ok(Insert::Ignored(IgnoreReason::AlreadyPlayed));
        }
        if (packet_id - self.start_id) % self.payload_size != 0 {
            return Ok(Insert::Ignored(IgnoreReason::Misaligned));
        }

        // the id after this one must stay representable
        if packet_id.checked_add(self.payload_size).is_none() {
            return Ok(Insert::Ignored(IgnoreReason::Malformed));
        }

        let slot_number = self.slot_number(packet_id);
        if slot_number < self.next_play {
            return Ok(Insert::Ignored(IgnoreReason::AlreadyPlayed));
        }

        let lead = slot_number - self.next_play;
        if lead >= self.max_lead as u64 {
            return Err(DesyncError::TooFarAhead {
                packet_id,
                lead,
                max_lead: self.max_lead,
            });
        }

        let mut outcome = Insert::Stored;
        let expected = self.max_seen.saturating_add(self.payload_size);
        if packet_id > expected {
            // slots between the old maximum and this packet held already played audio
            for missing in self.slot_number(self.max_seen) + 1..slot_number {
                let idx = self.index(missing);
                self.slots[idx].fresh = false;
            }
            outcome = Insert::Gap(GapRange::new(expected, packet_id - self.payload_size));
        }
        if packet_id > self.max_seen {
            self.max_seen = packet_id;
        }

        let idx = self.index(slot_number);
        self.slots[idx] = Slot {
            packet_id,
            payload: packet.payload,
            fresh: true,
        };

        Ok(outcome)
    }

    /// Take the payload due for playback and advance the play cursor
    pub fn pop_due(&mut self) -> Result<Bytes, DesyncError> {
        let due_id = self.due_id();
        let idx = self.index(self.next_play);
        let slot = &mut self.slots[idx];

        if !slot.fresh || slot.packet_id != due_id {
            return Err(DesyncError::StaleSlot { packet_id: due_id });
        }

        slot.fresh = false;
        self.next_play += 1;
        Ok(slot.payload.clone())
    }

    /// Packet id that will be played next
    pub fn due_id(&self) -> u64 {
        self.start_id
            .saturating_add(self.next_play.saturating_mul(self.payload_size))
    }

    /// Packet id of the most recently played packet
    pub fn last_played(&self) -> Option<u64> {
        self.next_play
            .checked_sub(1)
            .map(|n| self.start_id + n * self.payload_size)
    }

    /// Whether the packet with the given id is stored and not yet played
    pub fn is_fresh(&self, packet_id: u64) -> bool {
        if packet_id < self.start_id || (packet_id - self.start_id) % self.payload_size != 0 {
            return false;
        }
        let slot = &self.slots[self.index(self.slot_number(packet_id))];
        slot.fresh && slot.packet_id == packet_id
    }

    /// Number of slots holding unplayed audio
    pub fn fresh_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.fresh).count()
    }

    /// Session id of the buffered stream
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Packet id the session started at
    pub fn start_id(&self) -> u64 {
        self.start_id
    }

    /// Highest packet id stored so far
    pub fn max_seen(&self) -> u64 {
        self.max_seen
    }

    /// Audio bytes per packet
    pub fn payload_size(&self) -> u64 {
        self.payload_size
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Maximum accepted distance ahead of the play cursor, in slots
    pub fn max_lead(&self) -> usize {
        self.max_lead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(session: u64, id: u64) -> AudioPacket {
        AudioPacket::new(session, id, Bytes::from(vec![(id / 100) as u8; 100]))
    }

    fn buffer(capacity: usize) -> PlaybackBuffer {
        PlaybackBuffer::start(packet(1, 0), capacity * 100, None).unwrap()
    }

    #[test]
    fn test_capacity_from_first_packet() {
        let buffer = PlaybackBuffer::start(packet(1, 0), 450, None).unwrap();
        assert_eq!(buffer.capacity(), 4);
        assert_eq!(buffer.payload_size(), 100);
        assert_eq!(buffer.max_lead(), 4);

        let tiny = PlaybackBuffer::start(packet(1, 0), 10, None).unwrap();
        assert_eq!(tiny.capacity(), 1);
    }

    #[test]
    fn test_in_order_playback() {
        let mut buffer = buffer(4);
        assert_eq!(buffer.insert(packet(1, 100)), Ok(Insert::Stored));
        assert_eq!(buffer.insert(packet(1, 200)), Ok(Insert::Stored));

        assert_eq!(buffer.pop_due().unwrap()[0], 0);
        assert_eq!(buffer.pop_due().unwrap()[0], 1);
        assert_eq!(buffer.last_played(), Some(100));
        assert_eq!(buffer.pop_due().unwrap()[0], 2);
        assert_eq!(
            buffer.pop_due(),
            Err(DesyncError::StaleSlot { packet_id: 300 })
        );
    }

    #[test]
    fn test_gap_detected_and_filled() {
        let mut buffer = buffer(4);
        buffer.insert(packet(1, 100)).unwrap();

        assert_eq!(
            buffer.insert(packet(1, 300)),
            Ok(Insert::Gap(GapRange::single(200)))
        );
        assert!(!buffer.is_fresh(200));
        assert_eq!(buffer.max_seen(), 300);

        // retransmission fills the hole without moving max_seen back
        assert_eq!(buffer.insert(packet(1, 200)), Ok(Insert::Stored));
        assert!(buffer.is_fresh(200));
        assert_eq!(buffer.max_seen(), 300);

        for expected in 0..4 {
            assert_eq!(buffer.pop_due().unwrap()[0], expected);
        }
    }

    #[test]
    fn test_gap_marks_wrapped_slots_stale() {
        let mut buffer = buffer(4);
        for id in [100, 200, 300] {
            buffer.insert(packet(1, id)).unwrap();
        }
        for _ in 0..3 {
            buffer.pop_due().unwrap();
        }

        // 400 and 500 lost, their slots still hold already played audio
        assert_eq!(
            buffer.insert(packet(1, 600)),
            Ok(Insert::Gap(GapRange::new(400, 500)))
        );
        buffer.pop_due().unwrap();
        assert_eq!(
            buffer.pop_due(),
            Err(DesyncError::StaleSlot { packet_id: 400 })
        );
    }

    #[test]
    fn test_ignored_packets() {
        let mut buffer = buffer(4);
        buffer.insert(packet(1, 100)).unwrap();
        buffer.pop_due().unwrap();

        assert_eq!(
            buffer.insert(packet(0, 200)),
            Ok(Insert::Ignored(IgnoreReason::OlderSession))
        );
        assert_eq!(
            buffer.insert(packet(1, 0)),
            Ok(Insert::Ignored(IgnoreReason::AlreadyPlayed))
        );
        assert_eq!(
            buffer.insert(packet(1, 150)),
            Ok(Insert::Ignored(IgnoreReason::Misaligned))
        );
        assert_eq!(
            buffer.insert(AudioPacket::new(1, 200, Bytes::from_static(b"short"))),
            Ok(Insert::Ignored(IgnoreReason::PayloadSizeMismatch))
        );
        assert_eq!(buffer.max_seen(), 100);
    }

    #[test]
    fn test_packets_before_start_ignored() {
        let mut buffer = PlaybackBuffer::start(packet(1, 1000), 400, None).unwrap();
        assert_eq!(
            buffer.insert(packet(1, 900)),
            Ok(Insert::Ignored(IgnoreReason::AlreadyPlayed))
        );
    }

    #[test]
    fn test_newer_session_supersedes() {
        let mut buffer = buffer(4);
        assert_eq!(
            buffer.insert(packet(2, 0)),
            Err(DesyncError::SessionSuperseded {
                current: 1,
                incoming: 2
            })
        );
    }

    #[test]
    fn test_too_far_ahead() {
        let mut buffer = buffer(4);
        assert_eq!(
            buffer.insert(packet(1, 400)),
            Err(DesyncError::TooFarAhead {
                packet_id: 400,
                lead: 4,
                max_lead: 4
            })
        );

        let mut limited = PlaybackBuffer::start(packet(1, 0), 400, Some(2)).unwrap();
        assert!(limited.insert(packet(1, 100)).is_ok());
        assert!(limited.insert(packet(1, 200)).is_err());
    }

    #[test]
    fn test_duplicate_does_not_advance() {
        let mut buffer = buffer(4);
        buffer.insert(packet(1, 100)).unwrap();
        buffer.insert(packet(1, 100)).unwrap();

        assert_eq!(buffer.fresh_count(), 2);
        buffer.pop_due().unwrap();
        buffer.pop_due().unwrap();
        assert_eq!(
            buffer.insert(packet(1, 100)),
            Ok(Insert::Ignored(IgnoreReason::AlreadyPlayed))
        );
        assert!(buffer.pop_due().is_err());
    }

    #[test]
    fn test_start_near_top_of_id_space_rejected() {
        assert!(PlaybackBuffer::start(packet(1, u64::MAX - 50), 400, None).is_none());
        assert!(!PlaybackBuffer::fits(&packet(1, u64::MAX - 399), 400));

        // exactly room for four slots
        let edge = PlaybackBuffer::start(packet(1, u64::MAX - 400), 400, None).unwrap();
        assert_eq!(edge.capacity(), 4);
    }

    #[test]
    fn test_last_representable_id_ignored() {
        let mut buffer = PlaybackBuffer::start(packet(1, u64::MAX - 100), 100, None).unwrap();
        assert_eq!(
            buffer.insert(packet(1, u64::MAX)),
            Ok(Insert::Ignored(IgnoreReason::Malformed))
        );
        assert_eq!(buffer.max_seen(), u64::MAX - 100);
        assert_eq!(buffer.pop_due().unwrap().len(), 100);
    }
}
