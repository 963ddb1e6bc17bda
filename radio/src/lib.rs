//! Radio - multicast audio streaming with repair and discovery
//!
//! High-level runtime: the sender and receiver engines built on the protocol
//! core, the discovery crate and the transport crate, all re-exported here.

pub use radio_discovery as discovery;
pub use radio_io as io;
pub use radio_protocol as protocol;

pub mod error;
pub mod receiver;
pub mod sender;
pub mod shutdown;
pub mod stats;

pub use error::EngineError;
pub use receiver::{ReceiverEngine, ReceiverHandle, ReceiverOptions, ReceiverTransports};
pub use sender::{SenderEngine, SenderOptions, SenderTransports};
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
pub use stats::{ReceiverStats, ReceiverStatsSnapshot, SenderStats, SenderStatsSnapshot};

// Re-export commonly used types
pub use discovery::{StationNavigator, Tuner};
pub use protocol::{AudioPacket, ControlMessage, PlaybackPolicy};
