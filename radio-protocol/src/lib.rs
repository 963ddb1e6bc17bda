//! Radio Protocol Core Implementation
//!
//! This crate implements the streaming core shared by the sender and the
//! receiver: audio packet framing, control messages, the sender's repair
//! history, the receiver's playback buffer with gap detection, the playback
//! state machine, and retransmission batching. It performs no I/O; clock
//! values are passed in by the caller.

pub mod buffer;
pub mod control;
pub mod history;
pub mod loss;
pub mod packet;
pub mod playback;
pub mod rexmit;

pub use buffer::{DesyncError, IgnoreReason, Insert, PlaybackBuffer};
pub use control::{ControlError, ControlMessage, RexmitRequest, StationAnnouncement};
pub use history::SendHistory;
pub use loss::GapRange;
pub use packet::{AudioPacket, PacketError, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use playback::{Ingest, Playback, PlaybackPolicy, PlaybackState};
pub use rexmit::{PendingRepairs, RepairBatch, RexmitScheduler};
