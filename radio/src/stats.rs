//! Engine statistics
//!
//! Lock-free counters updated by the engine units and read as snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

/// Sender counters
#[derive(Debug, Default)]
pub struct SenderStats {
    packets_sent: AtomicU64,
    repairs_resent: AtomicU64,
    lookups_answered: AtomicU64,
    repair_ids_received: AtomicU64,
}

/// Point-in-time copy of [`SenderStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStatsSnapshot {
    pub packets_sent: u64,
    pub repairs_resent: u64,
    pub lookups_answered: u64,
    pub repair_ids_received: u64,
}

impl SenderStats {
    pub(crate) fn packet_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn repair_resent(&self) {
        self.repairs_resent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn lookup_answered(&self) {
        self.lookups_answered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn repair_ids_received(&self, count: usize) {
        self.repair_ids_received
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Read every counter
    pub fn snapshot(&self) -> SenderStatsSnapshot {
        SenderStatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            repairs_resent: self.repairs_resent.load(Ordering::Relaxed),
            lookups_answered: self.lookups_answered.load(Ordering::Relaxed),
            repair_ids_received: self.repair_ids_received.load(Ordering::Relaxed),
        }
    }
}

/// Receiver counters
#[derive(Debug, Default)]
pub struct ReceiverStats {
    datagrams_received: AtomicU64,
    sessions_started: AtomicU64,
    gaps_detected: AtomicU64,
    frames_played: AtomicU64,
    desyncs: AtomicU64,
    repair_requests_sent: AtomicU64,
}

/// Point-in-time copy of [`ReceiverStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStatsSnapshot {
    pub datagrams_received: u64,
    pub sessions_started: u64,
    pub gaps_detected: u64,
    pub frames_played: u64,
    pub desyncs: u64,
    pub repair_requests_sent: u64,
}

impl ReceiverStats {
    pub(crate) fn datagram_received(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn gap_detected(&self) {
        self.gaps_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_played(&self) {
        self.frames_played.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn desync(&self) {
        self.desyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn repair_request_sent(&self) {
        self.repair_requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter
    pub fn snapshot(&self) -> ReceiverStatsSnapshot {
        ReceiverStatsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            gaps_detected: self.gaps_detected.load(Ordering::Relaxed),
            frames_played: self.frames_played.load(Ordering::Relaxed),
            desyncs: self.desyncs.load(Ordering::Relaxed),
            repair_requests_sent: self.repair_requests_sent.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshots() {
        let stats = SenderStats::default();
        stats.packet_sent();
        stats.packet_sent();
        stats.repair_ids_received(3);
        let snap = stats.snapshot();
        assert_eq!(snap.packets_sent, 2);
        assert_eq!(snap.repair_ids_received, 3);
        assert_eq!(snap.lookups_answered, 0);

        let stats = ReceiverStats::default();
        stats.gap_detected();
        stats.desync();
        assert_eq!(stats.snapshot().gaps_detected, 1);
        assert_eq!(stats.snapshot().desyncs, 1);
    }
}
