//! Loss ranges detected by the receiver
//!
//! A gap is a contiguous run of packet ids inferred from a forward jump in
//! the received ids. Packet ids are byte offsets, so walking a range needs the
//! stream's payload size as the step.

use std::fmt;

/// Inclusive range of missing packet ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapRange {
    /// First missing packet id
    pub first: u64,
    /// Last missing packet id (inclusive)
    pub last: u64,
}

impl GapRange {
    /// Create a new gap range
    pub fn new(first: u64, last: u64) -> Self {
        debug_assert!(first <= last, "gap range must not be reversed");
        GapRange { first, last }
    }

    /// Create a single-packet gap
    pub fn single(id: u64) -> Self {
        GapRange {
            first: id,
            last: id,
        }
    }

    /// Check if this range contains a packet id
    pub fn contains(&self, id: u64) -> bool {
        id >= self.first && id <= self.last
    }

    /// Number of packets in the range for the given payload size
    pub fn len(&self, payload_size: u64) -> u64 {
        if payload_size == 0 {
            return 0;
        }
        (self.last - self.first) / payload_size + 1
    }

    /// Check if this is a single packet
    pub fn is_single(&self) -> bool {
        self.first == self.last
    }

    /// Iterate over every missing packet id
    pub fn ids(&self, payload_size: u64) -> impl Iterator<Item = u64> {
        let GapRange { first, last } = *self;
        let step = payload_size.max(1) as usize;
        (first..=last).step_by(step)
    }
}

impl fmt::Display for GapRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.first, self.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single() {
        let gap = GapRange::single(200);
        assert!(gap.is_single());
        assert!(gap.contains(200));
        assert_eq!(gap.len(100), 1);
        assert_eq!(gap.ids(100).collect::<Vec<_>>(), vec![200]);
    }

    #[test]
    fn test_range_ids() {
        let gap = GapRange::new(512, 2048);
        assert_eq!(gap.len(512), 4);
        assert_eq!(gap.ids(512).collect::<Vec<_>>(), vec![512, 1024, 1536, 2048]);
        assert!(!gap.contains(511));
        assert!(gap.contains(2048));
        assert_eq!(gap.to_string(), "[512, 2048]");
    }
}
