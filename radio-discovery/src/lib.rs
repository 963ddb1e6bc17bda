//! Radio Station Discovery
//!
//! This crate tracks the stations a receiver has heard of, decides which one
//! plays, and exposes the navigation surface used by user interfaces.

pub mod directory;
pub mod navigation;
pub mod selection;

pub use directory::{
    DirectoryError, Eviction, StationDirectory, StationRecord, Upsert, DEFAULT_STATION_TIMEOUT,
};
pub use navigation::{StationNavigator, Tuner};
pub use selection::{ActiveStation, PlaybackSignal, SelectionError, StationSelector};
