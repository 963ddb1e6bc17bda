//! Retransmission bookkeeping
//!
//! Sender side: [`PendingRepairs`] collects requested packet ids between
//! transmission cycles.
//!
//! Receiver side: [`RexmitScheduler`] batches detected gaps into time
//! buckets. A bucket is picked by `now_ms % window_ms`, and each bucket has
//! its own lock so registering a gap never waits on a flush of another bucket.
//! Flushing a bucket yields at most one batch per station.

use crate::control::{RexmitRequest, MAX_REXMIT_MSG_LEN};
use crate::loss::GapRange;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::trace;

/// Deduplicated set of packet ids awaiting retransmission (sender)
#[derive(Debug, Default)]
pub struct PendingRepairs {
    ids: Mutex<BTreeSet<u64>>,
}

impl PendingRepairs {
    /// Create an empty set
    pub fn new() -> Self {
        PendingRepairs::default()
    }

    /// Merge requested ids; returns how many of them were not already pending
    pub fn merge(&self, ids: impl IntoIterator<Item = u64>) -> usize {
        let mut pending = self.ids.lock();
        ids.into_iter().filter(|id| pending.insert(*id)).count()
    }

    /// Take every pending id, leaving the set empty
    pub fn take(&self) -> BTreeSet<u64> {
        std::mem::take(&mut *self.ids.lock())
    }

    /// Number of pending ids
    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    /// Check if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}

/// Missing ids of one station, ready to be sent as repair requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairBatch {
    /// Station name
    pub station: String,
    /// Station control endpoint
    pub control: SocketAddr,
    /// Missing packet ids, ascending and unique
    pub ids: Vec<u64>,
}

impl RepairBatch {
    /// Encode the batch as one or more `LOUDER_PLEASE` datagrams
    pub fn encode(&self) -> Vec<Bytes> {
        RexmitRequest::encode_batched(&self.ids, MAX_REXMIT_MSG_LEN)
    }
}

#[derive(Debug)]
struct StationRepairs {
    control: SocketAddr,
    /// Gap and the payload size it was detected with
    ranges: Vec<(GapRange, u64)>,
}

/// Time-bucketed batching of repair requests (receiver)
pub struct RexmitScheduler {
    buckets: Vec<Mutex<HashMap<String, StationRepairs>>>,
    window_ms: u64,
}

impl RexmitScheduler {
    /// Create a scheduler with one bucket per millisecond of `window`
    pub fn new(window: Duration) -> Self {
        let window_ms = (window.as_millis() as u64).max(1);
        let buckets = (0..window_ms).map(|_| Mutex::new(HashMap::new())).collect();
        RexmitScheduler { buckets, window_ms }
    }

    /// Batching window in milliseconds
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Bucket index for a wall-clock time in milliseconds
    pub fn bucket_for(&self, now_ms: u64) -> usize {
        (now_ms % self.window_ms) as usize
    }

    /// Register a detected gap for `station`
    ///
    /// The latest control endpoint registered for a station in a bucket wins.
    pub fn register(
        &self,
        station: &str,
        control: SocketAddr,
        gap: GapRange,
        payload_size: u64,
        now_ms: u64,
    ) {
        let idx = self.bucket_for(now_ms);
        let mut bucket = self.buckets[idx].lock();
        let entry = bucket
            .entry(station.to_string())
            .or_insert_with(|| StationRepairs {
                control,
                ranges: Vec::new(),
            });
        entry.control = control;
        entry.ranges.push((gap, payload_size));
        trace!("Gap {} of '{}' queued in bucket {}", gap, station, idx);
    }

    /// Drain one bucket into per-station batches
    pub fn flush_bucket(&self, idx: usize) -> Vec<RepairBatch> {
        let Some(bucket) = self.buckets.get(idx) else {
            return Vec::new();
        };
        let drained = std::mem::take(&mut *bucket.lock());

        let mut batches: Vec<RepairBatch> = drained
            .into_iter()
            .filter_map(|(station, repairs)| {
                let ids: BTreeSet<u64> = repairs
                    .ranges
                    .iter()
                    .flat_map(|(gap, payload_size)| gap.ids(*payload_size))
                    .collect();
                if ids.is_empty() {
                    return None;
                }
                Some(RepairBatch {
                    station,
                    control: repairs.control,
                    ids: ids.into_iter().collect(),
                })
            })
            .collect();
        batches.sort_by(|a, b| a.station.cmp(&b.station));
        batches
    }

    /// Drain every bucket whose millisecond lies in `(last_ms, now_ms]`
    ///
    /// At most one full window of buckets is visited, so a long stall flushes
    /// everything exactly once.
    pub fn flush_due(&self, last_ms: u64, now_ms: u64) -> Vec<RepairBatch> {
        if now_ms <= last_ms {
            return Vec::new();
        }
        let span = (now_ms - last_ms).min(self.window_ms);

        let mut batches = Vec::new();
        for ms in (now_ms - span + 1)..=now_ms {
            batches.extend(self.flush_bucket(self.bucket_for(ms)));
        }
        batches
    }

    /// Drop every queued range of a station; returns how many were dropped
    pub fn forget_station(&self, station: &str) -> usize {
        self.buckets
            .iter()
            .filter_map(|bucket| bucket.lock().remove(station))
            .map(|repairs| repairs.ranges.len())
            .sum()
    }

    /// Number of queued ranges across all buckets
    pub fn pending_ranges(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.lock().values().map(|r| r.ranges.len()).sum::<usize>())
            .sum()
    }
}
