//! Sender engine
//!
//! Four units share the engine state:
//!
//! - the transmission loop ([`SenderEngine::run`]) reads the input in
//!   payload-sized frames, multicasts them for one cadence and then resends
//!   whatever repairs are pending,
//! - the lookup listener answers discovery lookups by queueing the asker,
//! - the reply drainer sends the queued discovery replies,
//! - the repair listener merges repair requests into the pending set.

use crate::error::EngineError;
use crate::shutdown::ShutdownSignal;
use crate::stats::SenderStats;
use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use radio_io::{unix_secs, DatagramTransport};
use radio_protocol::control::MAX_NAME_LEN;
use radio_protocol::{
    AudioPacket, ControlMessage, PendingRepairs, SendHistory, StationAnnouncement,
    MAX_PAYLOAD_SIZE,
};
use std::io::{self, ErrorKind, Read};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Largest control datagram the listeners read
const CTRL_BUFFER_LEN: usize = 65536;

/// Sender settings
#[derive(Debug, Clone)]
pub struct SenderOptions {
    /// Multicast group and port the audio goes to
    pub data_addr: SocketAddrV4,
    /// Station name announced in discovery replies
    pub name: String,
    /// Audio bytes per packet
    pub payload_size: usize,
    /// Bytes of sent audio kept for repairs
    pub history_bytes: usize,
    /// Length of a transmission cycle before pending repairs are served
    pub cadence: Duration,
    /// Session id; the wall-clock start second when unset
    pub session_id: Option<u64>,
}

impl SenderOptions {
    /// Check the options before any socket is touched
    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.data_addr.ip().is_multicast() {
            return Err(EngineError::InvalidOption(format!(
                "{} is not a multicast address",
                self.data_addr.ip()
            )));
        }
        if self.data_addr.port() == 0 {
            return Err(EngineError::InvalidOption("data port must not be 0".into()));
        }
        if self.payload_size == 0 || self.payload_size > MAX_PAYLOAD_SIZE {
            return Err(EngineError::InvalidOption(format!(
                "payload size must be within 1..={}",
                MAX_PAYLOAD_SIZE
            )));
        }
        if self.history_bytes == 0 {
            return Err(EngineError::InvalidOption("history size must not be 0".into()));
        }
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return Err(EngineError::InvalidOption(format!(
                "station name must be 1 to {} bytes",
                MAX_NAME_LEN
            )));
        }
        Ok(())
    }
}

/// Sockets used by the sender
#[derive(Clone)]
pub struct SenderTransports {
    /// Sends audio to the data group
    pub data: Arc<dyn DatagramTransport>,
    /// Bound to the control port; receives lookups (should time out reads)
    pub lookup: Arc<dyn DatagramTransport>,
    /// Sends discovery replies and receives repair requests (should time out reads)
    pub reply: Arc<dyn DatagramTransport>,
}

/// Sender engine
pub struct SenderEngine {
    options: SenderOptions,
    transports: SenderTransports,
    session_id: u64,
    next_id: u64,
    history: SendHistory,
    pending: Arc<PendingRepairs>,
    stats: Arc<SenderStats>,
    reply: Bytes,
    shutdown: ShutdownSignal,
}

impl SenderEngine {
    /// Create a sender; nothing is sent until [`run`](Self::run)
    pub fn new(
        options: SenderOptions,
        transports: SenderTransports,
        shutdown: ShutdownSignal,
    ) -> Result<Self, EngineError> {
        options.validate()?;

        let announcement = StationAnnouncement::new(options.data_addr, options.name.clone())
            .map_err(|e| EngineError::InvalidOption(e.to_string()))?;
        let reply = ControlMessage::Reply(announcement).to_bytes();
        let session_id = options.session_id.unwrap_or_else(unix_secs);
        let history = SendHistory::with_byte_budget(options.history_bytes, options.payload_size);

        info!(
            "Station '{}' session {} on {} ({} byte payload, {} packets of history)",
            options.name,
            session_id,
            options.data_addr,
            options.payload_size,
            history.capacity()
        );

        Ok(SenderEngine {
            options,
            transports,
            session_id,
            next_id: 0,
            history,
            pending: Arc::new(PendingRepairs::new()),
            stats: Arc::new(SenderStats::default()),
            reply,
            shutdown,
        })
    }

    /// Session id stamped on every packet
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Shared statistics
    pub fn stats(&self) -> Arc<SenderStats> {
        Arc::clone(&self.stats)
    }

    /// Repairs waiting for the next cycle
    pub fn pending(&self) -> Arc<PendingRepairs> {
        Arc::clone(&self.pending)
    }

    /// Packets kept for repairs
    pub fn history(&self) -> &SendHistory {
        &self.history
    }

    /// Start the lookup listener, the reply drainer and the repair listener
    ///
    /// The units run until shutdown is triggered.
    pub fn spawn_listeners(&self) -> Result<Vec<JoinHandle<()>>, EngineError> {
        let (queue_tx, queue_rx) = channel::unbounded();

        let lookup = {
            let transport = Arc::clone(&self.transports.lookup);
            let shutdown = self.shutdown.clone();
            spawn("lookup-listener", move || {
                lookup_listener(transport, queue_tx, shutdown)
            })?
        };

        let drainer = {
            let transport = Arc::clone(&self.transports.reply);
            let reply = self.reply.clone();
            let stats = Arc::clone(&self.stats);
            let shutdown = self.shutdown.clone();
            spawn("reply-drainer", move || {
                reply_drainer(transport, queue_rx, reply, stats, shutdown)
            })?
        };

        let repairs = {
            let transport = Arc::clone(&self.transports.reply);
            let pending = Arc::clone(&self.pending);
            let stats = Arc::clone(&self.stats);
            let shutdown = self.shutdown.clone();
            spawn("repair-listener", move || {
                repair_listener(transport, pending, stats, shutdown)
            })?
        };

        Ok(vec![lookup, drainer, repairs])
    }

    /// Stream `input` until it ends or shutdown is triggered
    ///
    /// Returns the number of packets transmitted (not counting repairs).
    pub fn run<R: Read>(&mut self, mut input: R) -> Result<u64, EngineError> {
        let mut frame = vec![0u8; self.options.payload_size];
        let mut sent = 0;

        loop {
            let (count, more) = self.transmit_cycle(&mut input, &mut frame)?;
            sent += count;
            self.repair_cycle();

            if !more || self.shutdown.is_triggered() {
                break;
            }
        }

        info!("Input finished after {} packets", sent);
        Ok(sent)
    }

    /// Send frames for one cadence; returns the count and whether input remains
    fn transmit_cycle<R: Read>(
        &mut self,
        input: &mut R,
        frame: &mut [u8],
    ) -> Result<(u64, bool), EngineError> {
        let start = Instant::now();
        let mut count = 0;

        loop {
            if !read_frame(input, frame)? {
                return Ok((count, false));
            }

            let packet = AudioPacket::new(self.session_id, self.next_id, Bytes::copy_from_slice(frame));
            self.send(&packet);
            self.stats.packet_sent();
            self.history.push(packet);
            self.next_id += self.options.payload_size as u64;
            count += 1;

            if start.elapsed() >= self.options.cadence || self.shutdown.is_triggered() {
                return Ok((count, true));
            }
        }
    }

    /// Resend every pending repair still held in the history
    pub fn repair_cycle(&mut self) -> usize {
        let requested = self.pending.take();
        if requested.is_empty() {
            return 0;
        }

        let repairs = self.history.collect_repairs(&requested);
        let resent = repairs.len();
        for packet in repairs {
            debug!("Resending packet {}", packet.packet_id);
            self.send(packet);
            self.stats.repair_resent();
        }
        if resent < requested.len() {
            debug!(
                "{} of {} requested packets are no longer in the history",
                requested.len() - resent,
                requested.len()
            );
        }
        resent
    }

    fn send(&self, packet: &AudioPacket) {
        let target = SocketAddr::V4(self.options.data_addr);
        if let Err(e) = self.transports.data.send_to(&packet.to_bytes(), target) {
            warn!("Failed to send packet {}: {}", packet.packet_id, e);
        }
    }
}

/// Read one full frame; `false` at end of input
///
/// A trailing partial frame is discarded.
fn read_frame<R: Read>(input: &mut R, frame: &mut [u8]) -> io::Result<bool> {
    match input.read_exact(frame) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn spawn<F>(name: &'static str, f: F) -> Result<JoinHandle<()>, EngineError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.into())
        .spawn(f)
        .map_err(|source| EngineError::Spawn { unit: name, source })
}

fn lookup_listener(
    transport: Arc<dyn DatagramTransport>,
    queue: Sender<SocketAddr>,
    shutdown: ShutdownSignal,
) {
    let mut buf = vec![0u8; CTRL_BUFFER_LEN];

    while !shutdown.is_triggered() {
        let (n, from) = match transport.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                warn!("Lookup listener receive error: {}", e);
                continue;
            }
        };

        match ControlMessage::parse(&buf[..n]) {
            Ok(ControlMessage::Lookup) => {
                debug!("Lookup from {}", from);
                if queue.send(from).is_err() {
                    break;
                }
            }
            Ok(_) => debug!("Ignoring non-lookup message from {}", from),
            Err(e) => debug!("Ignoring control message from {}: {}", from, e),
        }
    }
}

fn reply_drainer(
    transport: Arc<dyn DatagramTransport>,
    queue: Receiver<SocketAddr>,
    reply: Bytes,
    stats: Arc<SenderStats>,
    shutdown: ShutdownSignal,
) {
    let poll = Duration::from_millis(100);

    while !shutdown.is_triggered() {
        let asker = match queue.recv_timeout(poll) {
            Ok(asker) => asker,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match transport.send_to(&reply, asker) {
            Ok(_) => stats.lookup_answered(),
            Err(e) => warn!("Failed to reply to {}: {}", asker, e),
        }
    }
}

fn repair_listener(
    transport: Arc<dyn DatagramTransport>,
    pending: Arc<PendingRepairs>,
    stats: Arc<SenderStats>,
    shutdown: ShutdownSignal,
) {
    let mut buf = vec![0u8; CTRL_BUFFER_LEN];

    while !shutdown.is_triggered() {
        let (n, from) = match transport.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                warn!("Repair listener receive error: {}", e);
                continue;
            }
        };

        match ControlMessage::parse(&buf[..n]) {
            Ok(ControlMessage::Rexmit(request)) => {
                if request.skipped > 0 {
                    debug!("Skipped {} malformed ids from {}", request.skipped, from);
                }
                stats.repair_ids_received(request.ids.len());
                let added = pending.merge(request.ids);
                debug!("Repair request from {}: {} new ids", from, added);
            }
            Ok(_) => debug!("Ignoring non-repair message from {}", from),
            Err(e) => debug!("Ignoring control message from {}: {}", from, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::shutdown_channel;
    use radio_io::MemoryNetwork;
    use std::io::Cursor;

    fn options() -> SenderOptions {
        SenderOptions {
            data_addr: "239.10.11.12:25826".parse().unwrap(),
            name: "Test Station".into(),
            payload_size: 4,
            history_bytes: 16,
            cadence: Duration::from_millis(250),
            session_id: Some(77),
        }
    }

    fn transports(net: &MemoryNetwork) -> SenderTransports {
        SenderTransports {
            data: Arc::new(net.bind("10.0.0.1:0".parse().unwrap()).unwrap()),
            lookup: Arc::new(net.bind("10.0.0.1:35826".parse().unwrap()).unwrap()),
            reply: Arc::new(net.bind("10.0.0.1:0".parse().unwrap()).unwrap()),
        }
    }

    #[test]
    fn test_validate() {
        assert!(options().validate().is_ok());

        let mut bad = options();
        bad.data_addr = "10.0.0.1:25826".parse().unwrap();
        assert!(bad.validate().is_err());

        let mut bad = options();
        bad.payload_size = 0;
        assert!(bad.validate().is_err());

        let mut bad = options();
        bad.name = "x".repeat(65);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_read_frame_discards_partial_tail() {
        let mut input = Cursor::new(vec![1u8; 10]);
        let mut frame = [0u8; 4];
        assert!(read_frame(&mut input, &mut frame).unwrap());
        assert!(read_frame(&mut input, &mut frame).unwrap());
        assert!(!read_frame(&mut input, &mut frame).unwrap());
    }

    #[test]
    fn test_run_streams_and_keeps_history() {
        let net = MemoryNetwork::new();
        let listener = net.bind("10.0.0.2:0".parse().unwrap()).unwrap();
        listener
            .join_multicast("239.10.11.12:25826".parse().unwrap())
            .unwrap();

        let (_trigger, shutdown) = shutdown_channel();
        let mut engine = SenderEngine::new(options(), transports(&net), shutdown).unwrap();

        let input: Vec<u8> = (0u8..26).collect();
        assert_eq!(engine.run(Cursor::new(input)).unwrap(), 6);
        assert_eq!(listener.pending(), 6);
        assert_eq!(engine.history().len(), 4);
        assert_eq!(engine.history().newest_id(), Some(20));

        let mut buf = [0u8; 64];
        let (n, _) = listener.recv_from(&mut buf).unwrap();
        let first = AudioPacket::from_bytes(&buf[..n]).unwrap();
        assert_eq!(first.session_id, 77);
        assert_eq!(first.packet_id, 0);
        assert_eq!(&first.payload[..], &[0, 1, 2, 3]);
    }

    #[test]
    fn test_repair_cycle_serves_history_only() {
        let net = MemoryNetwork::new();
        let listener = net.bind("10.0.0.2:0".parse().unwrap()).unwrap();
        listener
            .join_multicast("239.10.11.12:25826".parse().unwrap())
            .unwrap();

        let (_trigger, shutdown) = shutdown_channel();
        let mut engine = SenderEngine::new(options(), transports(&net), shutdown).unwrap();
        engine.run(Cursor::new(vec![0u8; 24])).unwrap();
        let before = listener.pending();

        // history keeps ids 8..=20; 0 is gone and 9 was never sent
        engine.pending().merge([0, 8, 9, 20]);
        assert_eq!(engine.repair_cycle(), 2);
        assert_eq!(listener.pending(), before + 2);
        assert!(engine.pending().is_empty());
        assert_eq!(engine.stats().snapshot().repairs_resent, 2);
    }
}
