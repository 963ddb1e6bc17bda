//! Receiver playback state machine
//!
//! `Uninitialized -> Buffering -> Playing`, back to `Uninitialized` on any
//! desync or on an explicit reset (station switch).
//!
//! The first datagram fixes the payload size and allocates the buffer.
//! Playback starts once the highest id seen reaches a configurable share of
//! the buffer. While playing, every due slot must be fresh; the first one that
//! is not ends the session.

use crate::buffer::{DesyncError, IgnoreReason, Insert, PlaybackBuffer};
use crate::loss::GapRange;
use crate::packet::AudioPacket;
use bytes::Bytes;
use tracing::{debug, info};

/// Default receive buffer size in bytes
pub const DEFAULT_BUFFER_BYTES: usize = 65536;

/// Default share of the buffer to fill before playback starts
pub const DEFAULT_START_FILL_RATIO: f64 = 0.75;

/// Tunables of the playback state machine
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackPolicy {
    /// Buffer size in bytes; capacity is `buffer_bytes / payload_size` slots
    pub buffer_bytes: usize,
    /// Share of the buffer (0.0..=1.0) that must be covered before playing
    pub start_fill_ratio: f64,
    /// Maximum distance ahead of the play cursor, in slots (default: capacity)
    pub max_lead: Option<usize>,
}

impl Default for PlaybackPolicy {
    fn default() -> Self {
        PlaybackPolicy {
            buffer_bytes: DEFAULT_BUFFER_BYTES,
            start_fill_ratio: DEFAULT_START_FILL_RATIO,
            max_lead: None,
        }
    }
}

impl PlaybackPolicy {
    /// Number of slots past the start id that must be seen before playing
    pub fn start_threshold_slots(&self, capacity: usize) -> u64 {
        let ratio = self.start_fill_ratio.clamp(0.0, 1.0);
        (capacity as f64 * ratio).floor() as u64
    }
}

/// Playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// No session; waiting for the first datagram
    Uninitialized,
    /// Session started, filling the buffer
    Buffering,
    /// Emitting audio
    Playing,
}

/// Outcome of handling one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingest {
    /// The datagram started a new session
    Started {
        session_id: u64,
        start_id: u64,
        payload_size: u64,
        capacity: usize,
    },
    /// A higher session id replaced the running session; playback restarted
    /// from this datagram
    Superseded { previous: u64, session_id: u64 },
    /// Packet stored
    Stored,
    /// Packet stored after a forward jump; the range needs retransmission
    Gap(GapRange),
    /// Packet dropped
    Ignored(IgnoreReason),
}

/// Receiver playback state machine
pub struct Playback {
    policy: PlaybackPolicy,
    buffer: Option<PlaybackBuffer>,
    playing: bool,
}

impl Playback {
    /// Create an uninitialized state machine
    pub fn new(policy: PlaybackPolicy) -> Self {
        Playback {
            policy,
            buffer: None,
            playing: false,
        }
    }

    /// Current state
    pub fn state(&self) -> PlaybackState {
        match (&self.buffer, self.playing) {
            (None, _) => PlaybackState::Uninitialized,
            (Some(_), false) => PlaybackState::Buffering,
            (Some(_), true) => PlaybackState::Playing,
        }
    }

    /// The active buffer, if a session is running
    pub fn buffer(&self) -> Option<&PlaybackBuffer> {
        self.buffer.as_ref()
    }

    /// Policy in use
    pub fn policy(&self) -> &PlaybackPolicy {
        &self.policy
    }

    /// Drop the session and return to `Uninitialized`
    pub fn reset(&mut self) {
        self.buffer = None;
        self.playing = false;
    }

    /// Handle a raw datagram received on the data group
    pub fn on_datagram(&mut self, bytes: &[u8]) -> Result<Ingest, DesyncError> {
        match AudioPacket::from_bytes(bytes) {
            Ok(packet) => self.on_packet(packet),
            Err(e) => {
                debug!("Dropping malformed audiogram: {}", e);
                Ok(Ingest::Ignored(IgnoreReason::Malformed))
            }
        }
    }

    /// Handle a decoded audio packet
    ///
    /// Errors are desyncs; the state machine has already reset itself when
    /// one is returned.
    pub fn on_packet(&mut self, packet: AudioPacket) -> Result<Ingest, DesyncError> {
        let Some(buffer) = self.buffer.as_mut() else {
            return Ok(self.begin(packet));
        };

        match buffer.insert(packet.clone()) {
            Ok(Insert::Stored) => {
                self.check_start();
                Ok(Ingest::Stored)
            }
            Ok(Insert::Gap(gap)) => {
                self.check_start();
                Ok(Ingest::Gap(gap))
            }
            Ok(Insert::Ignored(reason)) => Ok(Ingest::Ignored(reason)),
            Err(DesyncError::SessionSuperseded { current, incoming }) => {
                if !PlaybackBuffer::fits(&packet, self.policy.buffer_bytes) {
                    debug!(
                        "Packet {} of session {} leaves no room in the id space, ignoring",
                        packet.packet_id, incoming
                    );
                    return Ok(Ingest::Ignored(IgnoreReason::Malformed));
                }
                info!("Session {} superseded by {}, restarting", current, incoming);
                self.reset();
                self.begin(packet);
                Ok(Ingest::Superseded {
                    previous: current,
                    session_id: incoming,
                })
            }
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    /// Take the next frame to play, if playing
    ///
    /// Returns `Ok(None)` while uninitialized or buffering. A missing due
    /// frame resets the state machine and is reported as a desync.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, DesyncError> {
        if !self.playing {
            return Ok(None);
        }
        let Some(buffer) = self.buffer.as_mut() else {
            return Ok(None);
        };

        match buffer.pop_due() {
            Ok(frame) => Ok(Some(frame)),
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    fn begin(&mut self, packet: AudioPacket) -> Ingest {
        let (session_id, packet_id) = (packet.session_id, packet.packet_id);
        let Some(buffer) =
            PlaybackBuffer::start(packet, self.policy.buffer_bytes, self.policy.max_lead)
        else {
            debug!(
                "Packet {} of session {} leaves no room in the id space, ignoring",
                packet_id, session_id
            );
            return Ingest::Ignored(IgnoreReason::Malformed);
        };
        let started = Ingest::Started {
            session_id: buffer.session_id(),
            start_id: buffer.start_id(),
            payload_size: buffer.payload_size(),
            capacity: buffer.capacity(),
        };
        info!(
            "Session {} started at byte {} ({} byte payload, {} slots)",
            buffer.session_id(),
            buffer.start_id(),
            buffer.payload_size(),
            buffer.capacity()
        );
        self.buffer = Some(buffer);
        self.playing = false;
        self.check_start();
        started
    }

    fn check_start(&mut self) {
        if self.playing {
            return;
        }
        if let Some(buffer) = &self.buffer {
            let threshold = buffer
                .payload_size()
                .checked_mul(self.policy.start_threshold_slots(buffer.capacity()))
                .and_then(|span| buffer.start_id().checked_add(span));
            if threshold.map_or(false, |threshold| buffer.max_seen() >= threshold) {
                debug!("Buffer filled up to byte {}, playing", buffer.max_seen());
                self.playing = true;
            }
        }
    }
}
