//! Bounded history of sent packets
//!
//! The sender keeps the most recent packets so it can answer retransmission
//! requests. Packets enter in packet-id order and the oldest one is evicted
//! once the ring is full, so the history is always sorted by packet id.

use crate::packet::AudioPacket;
use std::collections::{BTreeSet, VecDeque};

/// Ring of previously sent packets
pub struct SendHistory {
    /// Stored packets, oldest first
    packets: VecDeque<AudioPacket>,
    /// Maximum number of packets kept
    capacity: usize,
}

impl SendHistory {
    /// Create a history sized for `history_bytes` of audio in `payload_size` chunks
    ///
    /// The history always holds at least one packet.
    pub fn with_byte_budget(history_bytes: usize, payload_size: usize) -> Self {
        let capacity = if payload_size == 0 {
            1
        } else {
            (history_bytes / payload_size).max(1)
        };
        SendHistory::new(capacity)
    }

    /// Create a history holding at most `capacity` packets
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        SendHistory {
            packets: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a freshly sent packet, evicting the oldest one if full
    ///
    /// Returns the evicted packet, if any.
    pub fn push(&mut self, packet: AudioPacket) -> Option<AudioPacket> {
        debug_assert!(
            self.packets
                .back()
                .map_or(true, |last| last.packet_id < packet.packet_id),
            "history must stay sorted by packet id"
        );

        let evicted = if self.packets.len() == self.capacity {
            self.packets.pop_front()
        } else {
            None
        };
        self.packets.push_back(packet);
        evicted
    }

    /// Find the stored packets matching the requested ids
    ///
    /// Both the request set and the history are ordered by packet id, so a
    /// single forward cursor walks them together. Ids that were evicted or
    /// never sent have no match and are skipped.
    pub fn collect_repairs<'a>(&'a self, requested: &BTreeSet<u64>) -> Vec<&'a AudioPacket> {
        let mut found = Vec::new();
        let mut cursor = 0;

        for &id in requested {
            while cursor < self.packets.len() && self.packets[cursor].packet_id < id {
                cursor += 1;
            }
            if cursor == self.packets.len() {
                break;
            }
            if self.packets[cursor].packet_id == id {
                found.push(&self.packets[cursor]);
                cursor += 1;
            }
        }

        found
    }

    /// Number of packets currently stored
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Check if the history is empty
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Maximum number of packets stored
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Id of the oldest packet still available for repair
    pub fn oldest_id(&self) -> Option<u64> {
        self.packets.front().map(|p| p.packet_id)
    }

    /// Id of the most recently sent packet
    pub fn newest_id(&self) -> Option<u64> {
        self.packets.back().map(|p| p.packet_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn packet(id: u64) -> AudioPacket {
        AudioPacket::new(7, id, Bytes::from(vec![(id / 100) as u8; 100]))
    }

    fn ids(found: &[&AudioPacket]) -> Vec<u64> {
        found.iter().map(|p| p.packet_id).collect()
    }

    #[test]
    fn test_capacity_from_byte_budget() {
        assert_eq!(SendHistory::with_byte_budget(400, 100).capacity(), 4);
        assert_eq!(SendHistory::with_byte_budget(450, 100).capacity(), 4);
        assert_eq!(SendHistory::with_byte_budget(50, 100).capacity(), 1);
    }

    #[test]
    fn test_oldest_evicted_first() {
        let mut history = SendHistory::new(2);

        assert!(history.push(packet(0)).is_none());
        assert!(history.push(packet(100)).is_none());
        let evicted = history.push(packet(200)).unwrap();

        assert_eq!(evicted.packet_id, 0);
        assert_eq!(history.len(), 2);
        assert_eq!(history.oldest_id(), Some(100));
        assert_eq!(history.newest_id(), Some(200));
    }

    #[test]
    fn test_collect_repairs_merges_in_order() {
        let mut history = SendHistory::new(8);
        for id in (0..8).map(|i| i * 100) {
            history.push(packet(id));
        }

        let requested: BTreeSet<u64> = [100, 150, 300, 700, 900].into_iter().collect();
        let found = history.collect_repairs(&requested);

        assert_eq!(ids(&found), vec![100, 300, 700]);
        assert_eq!(found[1].payload[0], 3);
    }

    #[test]
    fn test_collect_repairs_ignores_evicted() {
        let mut history = SendHistory::new(2);
        for id in [0, 100, 200, 300] {
            history.push(packet(id));
        }

        let requested: BTreeSet<u64> = [0, 100].into_iter().collect();
        assert!(history.collect_repairs(&requested).is_empty());

        let requested: BTreeSet<u64> = [0, 300].into_iter().collect();
        assert_eq!(ids(&history.collect_repairs(&requested)), vec![300]);
    }

    #[test]
    fn test_collect_repairs_empty_history() {
        let history = SendHistory::new(4);
        let requested: BTreeSet<u64> = [0].into_iter().collect();
        assert!(history.collect_repairs(&requested).is_empty());
        assert!(history.is_empty());
    }
}
