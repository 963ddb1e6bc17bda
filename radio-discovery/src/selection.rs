//! Station Selection
//!
//! The selector is the only writer of the active-station fields. Switching
//! stations halts the playback unit, moves the data transport from the old
//! multicast group to the new one, records the new station and then lets
//! playback resume from scratch.

use crate::directory::StationRecord;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use radio_io::{DatagramTransport, SocketError};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Selection errors
#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("Failed to join {group}: {source}")]
    Join {
        group: SocketAddrV4,
        #[source]
        source: SocketError,
    },

    #[error(transparent)]
    Directory(#[from] crate::directory::DirectoryError),
}

/// Signal sent to the playback unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackSignal {
    /// Stop playing and wait for `Resume`
    Halt,
    /// Start over with the newly selected station
    Resume,
}

/// The station currently played
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveStation {
    /// Station name
    pub name: String,
    /// Joined data group
    pub data: SocketAddrV4,
    /// Where repair requests go
    pub control: SocketAddr,
}

impl From<&StationRecord> for ActiveStation {
    fn from(record: &StationRecord) -> Self {
        ActiveStation {
            name: record.name.clone(),
            data: record.data,
            control: record.control,
        }
    }
}

/// Owner of the active-station fields
pub struct StationSelector {
    active: RwLock<Option<ActiveStation>>,
    /// Serializes whole switches
    switching: Mutex<()>,
    data: Arc<dyn DatagramTransport>,
    signal_tx: Sender<PlaybackSignal>,
    signal_rx: Receiver<PlaybackSignal>,
}

impl StationSelector {
    /// Create a selector driving the given data transport
    pub fn new(data: Arc<dyn DatagramTransport>) -> Self {
        let (signal_tx, signal_rx) = channel::unbounded();
        StationSelector {
            active: RwLock::new(None),
            switching: Mutex::new(()),
            data,
            signal_tx,
            signal_rx,
        }
    }

    /// Receiving end of the playback signal
    ///
    /// Meant for the single playback unit.
    pub fn subscribe(&self) -> Receiver<PlaybackSignal> {
        self.signal_rx.clone()
    }

    /// Data transport joined to the active group
    pub fn transport(&self) -> Arc<dyn DatagramTransport> {
        Arc::clone(&self.data)
    }

    /// Switch to `record`
    ///
    /// When joining fails no station is active and playback stays halted.
    pub fn select(&self, record: &StationRecord) -> Result<(), SelectionError> {
        let _switch = self.switching.lock();
        self.signal(PlaybackSignal::Halt);

        if let Err(e) = self.data.leave_multicast() {
            warn!("Failed to leave data group: {}", e);
        }

        if let Err(source) = self.data.join_multicast(record.data) {
            *self.active.write() = None;
            return Err(SelectionError::Join {
                group: record.data,
                source,
            });
        }

        *self.active.write() = Some(ActiveStation::from(record));
        info!("Tuned to '{}' at {}", record.name, record.data);

        self.signal(PlaybackSignal::Resume);
        Ok(())
    }

    /// Stop playing and leave the data group
    pub fn clear(&self) {
        let _switch = self.switching.lock();
        self.signal(PlaybackSignal::Halt);

        if let Err(e) = self.data.leave_multicast() {
            warn!("Failed to leave data group: {}", e);
        }
        if let Some(previous) = self.active.write().take() {
            info!("No station left to play after '{}'", previous.name);
        }
    }

    /// Snapshot of the active station
    pub fn active(&self) -> Option<ActiveStation> {
        self.active.read().clone()
    }

    /// Name of the active station
    pub fn active_name(&self) -> Option<String> {
        self.active.read().as_ref().map(|a| a.name.clone())
    }

    /// Check if `record` is the active station
    pub fn is_active(&self, record: &StationRecord) -> bool {
        self.active
            .read()
            .as_ref()
            .map_or(false, |a| record.is(&a.name, a.data))
    }

    /// Follow a control endpoint change of the active station
    pub fn update_control(&self, record: &StationRecord) {
        let mut active = self.active.write();
        if let Some(a) = active.as_mut() {
            if record.is(&a.name, a.data) {
                a.control = record.control;
            }
        }
    }

    fn signal(&self, signal: PlaybackSignal) {
        // The selector holds a receiver, so the channel never disconnects
        let _ = self.signal_tx.send(signal);
    }
}
