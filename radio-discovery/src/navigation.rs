//! Directory navigation
//!
//! [`Tuner`] ties the directory to the selector. It applies discovery replies
//! and maintenance passes, and implements the navigation surface an external
//! user interface drives.

use crate::directory::{Eviction, StationDirectory, Upsert};
use crate::selection::{SelectionError, StationSelector};
use radio_protocol::StationAnnouncement;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// What a user interface may do with the directory
pub trait StationNavigator: Send + Sync {
    /// Known station names, in order
    fn station_names(&self) -> Vec<String>;

    /// Name of the station playing now
    fn active_name(&self) -> Option<String>;

    /// Switch to the next name; returns the newly selected name
    fn select_next(&self) -> Result<Option<String>, SelectionError>;

    /// Switch to the previous name; returns the newly selected name
    fn select_previous(&self) -> Result<Option<String>, SelectionError>;
}

/// Directory plus selector plus the configured name filter
pub struct Tuner {
    directory: Arc<StationDirectory>,
    selector: Arc<StationSelector>,
    filter: Option<String>,
}

impl Tuner {
    /// Create a tuner; `filter` names the preferred station
    pub fn new(
        directory: Arc<StationDirectory>,
        selector: Arc<StationSelector>,
        filter: Option<String>,
    ) -> Self {
        Tuner {
            directory,
            selector,
            filter,
        }
    }

    /// The directory
    pub fn directory(&self) -> &Arc<StationDirectory> {
        &self.directory
    }

    /// The selector
    pub fn selector(&self) -> &Arc<StationSelector> {
        &self.selector
    }

    /// Apply a discovery reply received from `control`
    ///
    /// A new station is selected when nothing plays yet and the filter allows
    /// it, or when it is the filtered station and something else plays.
    pub fn ingest_reply(
        &self,
        announcement: &StationAnnouncement,
        control: SocketAddr,
        now: Instant,
    ) -> Result<Upsert, SelectionError> {
        let upsert = self.directory.upsert(announcement, control, now);
        let name = &announcement.name;

        match upsert {
            Upsert::Refreshed => {
                if let Some(record) = self
                    .directory
                    .records()
                    .into_iter()
                    .find(|r| r.is(name, announcement.data_addr))
                {
                    self.selector.update_control(&record);
                }
            }
            Upsert::Inserted => {
                let filter_matches = self.filter.as_deref() == Some(name.as_str());
                let should_select = match self.selector.active_name() {
                    None => self.filter.is_none() || filter_matches,
                    Some(active) => filter_matches && active != *name,
                };

                if should_select {
                    if let Some(record) = self
                        .directory
                        .records()
                        .into_iter()
                        .find(|r| r.is(name, announcement.data_addr))
                    {
                        self.selector.select(&record)?;
                    }
                }
            }
        }

        Ok(upsert)
    }

    /// Evict silent stations and replace the active one if it went away
    pub fn maintain(&self, now: Instant) -> Result<Eviction, SelectionError> {
        let eviction = self.directory.evict_expired(now);

        let active_lost = eviction
            .removed
            .iter()
            .any(|record| self.selector.is_active(record));

        if active_lost {
            match self.directory.first() {
                Some(record) => self.selector.select(&record)?,
                None => self.selector.clear(),
            }
        }

        Ok(eviction)
    }

    /// Select the first record of `name`
    pub fn select_name(&self, name: &str) -> Result<(), SelectionError> {
        let record = self.directory.require(name)?;
        self.selector.select(&record)
    }

    fn step(&self, forward: bool) -> Result<Option<String>, SelectionError> {
        let target = match self.selector.active_name() {
            Some(current) if forward => self.directory.next_name(&current),
            Some(current) => self.directory.previous_name(&current),
            None => self.directory.first().map(|r| r.name),
        };

        match target {
            Some(name) => {
                debug!("Navigating to '{}'", name);
                self.select_name(&name)?;
                Ok(Some(name))
            }
            None => Ok(None),
        }
    }
}

impl StationNavigator for Tuner {
    fn station_names(&self) -> Vec<String> {
        self.directory.names()
    }

    fn active_name(&self) -> Option<String> {
        self.selector.active_name()
    }

    fn select_next(&self) -> Result<Option<String>, SelectionError> {
        self.step(true)
    }

    fn select_previous(&self) -> Result<Option<String>, SelectionError> {
        self.step(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radio_io::{MemoryNetwork, MemoryTransport};
    use std::time::Duration;

    fn announce(name: &str, group: &str) -> StationAnnouncement {
        StationAnnouncement::new(group.parse().unwrap(), name).unwrap()
    }

    fn control() -> SocketAddr {
        "10.0.0.1:4000".parse().unwrap()
    }

    fn tuner(filter: Option<&str>) -> (Tuner, Arc<MemoryTransport>, MemoryNetwork) {
        let net = MemoryNetwork::new();
        let data = Arc::new(net.bind("10.0.0.9:0".parse().unwrap()).unwrap());
        let selector = Arc::new(StationSelector::new(data.clone()));
        let tuner = Tuner::new(
            Arc::new(StationDirectory::default()),
            selector,
            filter.map(str::to_string),
        );
        (tuner, data, net)
    }

    #[test]
    fn test_first_reply_selects() {
        let (tuner, data, _net) = tuner(None);
        let now = Instant::now();

        tuner
            .ingest_reply(&announce("Jazz", "239.0.0.1:25826"), control(), now)
            .unwrap();
        tuner
            .ingest_reply(&announce("Blues", "239.0.0.2:25826"), control(), now)
            .unwrap();

        assert_eq!(tuner.active_name().as_deref(), Some("Jazz"));
        assert_eq!(data.group(), Some("239.0.0.1:25826".parse().unwrap()));
        assert_eq!(tuner.station_names(), vec!["Blues", "Jazz"]);
    }

    #[test]
    fn test_filter_takes_over() {
        let (tuner, _data, _net) = tuner(Some("Rock"));
        let now = Instant::now();

        tuner
            .ingest_reply(&announce("Jazz", "239.0.0.1:25826"), control(), now)
            .unwrap();
        assert_eq!(tuner.active_name(), None);

        tuner
            .ingest_reply(&announce("Rock", "239.0.0.3:25826"), control(), now)
            .unwrap();
        assert_eq!(tuner.active_name().as_deref(), Some("Rock"));

        // a second sender of the filtered name does not steal the selection
        tuner
            .ingest_reply(&announce("Rock", "239.0.0.4:25826"), control(), now)
            .unwrap();
        assert_eq!(
            tuner.selector().active().unwrap().data,
            "239.0.0.3:25826".parse().unwrap()
        );
    }

    #[test]
    fn test_eviction_falls_back_to_first() {
        let (tuner, data, _net) = tuner(None);
        let start = Instant::now();
        tuner
            .ingest_reply(&announce("Jazz", "239.0.0.1:25826"), control(), start)
            .unwrap();
        tuner
            .ingest_reply(
                &announce("Rock", "239.0.0.3:25826"),
                control(),
                start + Duration::from_secs(15),
            )
            .unwrap();

        let eviction = tuner.maintain(start + Duration::from_secs(21)).unwrap();
        assert_eq!(eviction.vanished, vec!["Jazz".to_string()]);
        assert_eq!(tuner.active_name().as_deref(), Some("Rock"));
        assert_eq!(data.group(), Some("239.0.0.3:25826".parse().unwrap()));

        tuner.maintain(start + Duration::from_secs(40)).unwrap();
        assert_eq!(tuner.active_name(), None);
        assert_eq!(data.group(), None);
    }

    #[test]
    fn test_navigation_without_wrap() {
        let (tuner, _data, _net) = tuner(None);
        let now = Instant::now();
        for (name, group) in [
            ("Blues", "239.0.0.1:1"),
            ("Jazz", "239.0.0.2:1"),
            ("Rock", "239.0.0.3:1"),
        ] {
            tuner.ingest_reply(&announce(name, group), control(), now).unwrap();
        }
        assert_eq!(tuner.active_name().as_deref(), Some("Blues"));

        assert_eq!(tuner.select_previous().unwrap(), None);
        assert_eq!(tuner.select_next().unwrap().as_deref(), Some("Jazz"));
        assert_eq!(tuner.select_next().unwrap().as_deref(), Some("Rock"));
        assert_eq!(tuner.select_next().unwrap(), None);
        assert_eq!(tuner.active_name().as_deref(), Some("Rock"));
        assert_eq!(tuner.select_previous().unwrap().as_deref(), Some("Jazz"));
        assert_eq!(tuner.station_names().len(), 3);
    }
}
