//! Station Directory
//!
//! Known stations keyed by name. A name can be served by several senders, so
//! each name maps to the list of its records in arrival order. A record is
//! identified by its name together with its multicast data endpoint.

use parking_lot::RwLock;
use radio_protocol::StationAnnouncement;
use std::collections::BTreeMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::ops::Bound;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// A record is dropped once it has not answered for longer than this
pub const DEFAULT_STATION_TIMEOUT: Duration = Duration::from_secs(20);

/// Directory errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Unknown station: {0}")]
    UnknownStation(String),
}

/// One sender of a named station
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationRecord {
    /// Station name
    pub name: String,
    /// Multicast group and port carrying the audio
    pub data: SocketAddrV4,
    /// Control endpoint accepting repair requests
    pub control: SocketAddr,
    /// Last time this record answered a lookup
    pub last_seen: Instant,
}

impl StationRecord {
    /// Check if this record is the given (name, data endpoint) pair
    pub fn is(&self, name: &str, data: SocketAddrV4) -> bool {
        self.name == name && self.data == data
    }
}

/// Outcome of ingesting a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// A new (name, endpoint) pair
    Inserted,
    /// A known pair answered again
    Refreshed,
}

/// Records removed by a maintenance pass
#[derive(Debug, Clone, Default)]
pub struct Eviction {
    /// Every removed record
    pub removed: Vec<StationRecord>,
    /// Names that no longer have any record
    pub vanished: Vec<String>,
}

impl Eviction {
    /// Check if nothing was removed
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }
}

/// Directory of live stations
pub struct StationDirectory {
    stations: RwLock<BTreeMap<String, Vec<StationRecord>>>,
    timeout: Duration,
}

impl Default for StationDirectory {
    fn default() -> Self {
        StationDirectory::new(DEFAULT_STATION_TIMEOUT)
    }
}

impl StationDirectory {
    /// Create an empty directory with the given liveness timeout
    pub fn new(timeout: Duration) -> Self {
        StationDirectory {
            stations: RwLock::new(BTreeMap::new()),
            timeout,
        }
    }

    /// Liveness timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Insert a new record or refresh a known one
    ///
    /// A refresh also records the control endpoint the reply came from.
    pub fn upsert(
        &self,
        announcement: &StationAnnouncement,
        control: SocketAddr,
        now: Instant,
    ) -> Upsert {
        let mut stations = self.stations.write();
        let records = stations.entry(announcement.name.clone()).or_default();

        if let Some(record) = records
            .iter_mut()
            .find(|r| r.data == announcement.data_addr)
        {
            record.last_seen = now;
            record.control = control;
            return Upsert::Refreshed;
        }

        records.push(StationRecord {
            name: announcement.name.clone(),
            data: announcement.data_addr,
            control,
            last_seen: now,
        });
        info!(
            "Discovered station '{}' at {} (control {})",
            announcement.name, announcement.data_addr, control
        );
        Upsert::Inserted
    }

    /// Remove every record silent for longer than the timeout
    pub fn evict_expired(&self, now: Instant) -> Eviction {
        let mut stations = self.stations.write();
        let mut eviction = Eviction::default();
        let timeout = self.timeout;

        stations.retain(|name, records| {
            records.retain(|record| {
                let expired = now.saturating_duration_since(record.last_seen) > timeout;
                if expired {
                    info!("Station '{}' at {} timed out", record.name, record.data);
                    eviction.removed.push(record.clone());
                }
                !expired
            });
            if records.is_empty() {
                debug!("Name '{}' left the directory", name);
                eviction.vanished.push(name.clone());
            }
            !records.is_empty()
        });

        eviction
    }

    /// First record of the first name
    pub fn first(&self) -> Option<StationRecord> {
        self.stations
            .read()
            .values()
            .next()
            .and_then(|records| records.first().cloned())
    }

    /// First record of a name
    pub fn get(&self, name: &str) -> Option<StationRecord> {
        self.stations
            .read()
            .get(name)
            .and_then(|records| records.first().cloned())
    }

    /// First record of a name, or an error if the name is unknown
    pub fn require(&self, name: &str) -> Result<StationRecord, DirectoryError> {
        self.get(name)
            .ok_or_else(|| DirectoryError::UnknownStation(name.to_string()))
    }

    /// Known names in order
    pub fn names(&self) -> Vec<String> {
        self.stations.read().keys().cloned().collect()
    }

    /// Every record, grouped by name in name order
    pub fn records(&self) -> Vec<StationRecord> {
        self.stations.read().values().flatten().cloned().collect()
    }

    /// Name following `current` in name order
    pub fn next_name(&self, current: &str) -> Option<String> {
        self.stations
            .read()
            .range::<str, _>((Bound::Excluded(current), Bound::Unbounded))
            .next()
            .map(|(name, _)| name.clone())
    }

    /// Name preceding `current` in name order
    pub fn previous_name(&self, current: &str) -> Option<String> {
        self.stations
            .read()
            .range::<str, _>((Bound::Unbounded, Bound::Excluded(current)))
            .next_back()
            .map(|(name, _)| name.clone())
    }

    /// Check if a (name, data endpoint) record is known
    pub fn contains(&self, name: &str, data: SocketAddrV4) -> bool {
        self.stations
            .read()
            .get(name)
            .map_or(false, |records| records.iter().any(|r| r.data == data))
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.stations.read().values().map(Vec::len).sum()
    }

    /// Check if the directory is empty
    pub fn is_empty(&self) -> bool {
        self.stations.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce(name: &str, group: &str) -> StationAnnouncement {
        StationAnnouncement::new(group.parse().unwrap(), name).unwrap()
    }

    fn control(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn test_insert_and_refresh() {
        let directory = StationDirectory::default();
        let now = Instant::now();
        let jazz = announce("Jazz", "239.0.0.1:25826");

        assert_eq!(directory.upsert(&jazz, control(1), now), Upsert::Inserted);
        assert_eq!(
            directory.upsert(&jazz, control(2), now + Duration::from_secs(3)),
            Upsert::Refreshed
        );

        let record = directory.get("Jazz").unwrap();
        assert_eq!(record.control, control(2));
        assert_eq!(record.last_seen, now + Duration::from_secs(3));
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_same_name_many_senders() {
        let directory = StationDirectory::default();
        let now = Instant::now();
        directory.upsert(&announce("Jazz", "239.0.0.1:25826"), control(1), now);
        directory.upsert(&announce("Jazz", "239.0.0.2:25826"), control(2), now);

        assert_eq!(directory.len(), 2);
        assert_eq!(directory.names(), vec!["Jazz".to_string()]);
        assert_eq!(directory.get("Jazz").unwrap().control, control(1));
        assert!(directory.contains("Jazz", "239.0.0.2:25826".parse().unwrap()));
    }

    #[test]
    fn test_eviction_is_strict() {
        let directory = StationDirectory::default();
        let start = Instant::now();
        directory.upsert(&announce("Jazz", "239.0.0.1:25826"), control(1), start);
        directory.upsert(&announce("Rock", "239.0.0.2:25826"), control(2), start);
        directory.upsert(
            &announce("Rock", "239.0.0.2:25826"),
            control(2),
            start + Duration::from_secs(10),
        );

        assert!(directory
            .evict_expired(start + Duration::from_secs(20))
            .is_empty());

        let eviction = directory.evict_expired(start + Duration::from_secs(21));
        assert_eq!(eviction.removed.len(), 1);
        assert_eq!(eviction.removed[0].name, "Jazz");
        assert_eq!(eviction.vanished, vec!["Jazz".to_string()]);
        assert_eq!(directory.names(), vec!["Rock".to_string()]);
    }

    #[test]
    fn test_neighbours_in_name_order() {
        let directory = StationDirectory::default();
        let now = Instant::now();
        for (name, group) in [
            ("Rock", "239.0.0.3:1"),
            ("Blues", "239.0.0.1:1"),
            ("Jazz", "239.0.0.2:1"),
        ] {
            directory.upsert(&announce(name, group), control(1), now);
        }

        assert_eq!(directory.first().unwrap().name, "Blues");
        assert_eq!(directory.next_name("Blues").as_deref(), Some("Jazz"));
        assert_eq!(directory.next_name("Rock"), None);
        assert_eq!(directory.previous_name("Jazz").as_deref(), Some("Blues"));
        assert_eq!(directory.previous_name("Blues"), None);
        assert_eq!(
            directory.require("Pop"),
            Err(DirectoryError::UnknownStation("Pop".into()))
        );
    }
}
