//! Receiver engine
//!
//! Four units run once the engine starts:
//!
//! - lookup + maintenance: broadcasts a lookup every interval, then evicts
//!   silent stations,
//! - reply listener: feeds discovery replies into the directory,
//! - retransmission flusher: turns due buckets into repair requests,
//! - playback: reassembles the active station's audio and writes it out.
//!
//! The playback unit starts halted and follows [`PlaybackSignal`]s from the
//! station selector. It writes at most one frame per receive attempt, so the
//! sender's cadence paces the output. Timed out attempts still play a frame
//! while ignored datagrams play none. A duplicate is stored again and counts
//! as an arrival.

use crate::error::EngineError;
use crate::shutdown::ShutdownSignal;
use crate::stats::ReceiverStats;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use radio_discovery::{
    PlaybackSignal, StationDirectory, StationNavigator, StationSelector, Tuner,
    DEFAULT_STATION_TIMEOUT,
};
use radio_io::{unix_millis, DatagramTransport};
use radio_protocol::packet::MAX_DATAGRAM_SIZE;
use radio_protocol::playback::DEFAULT_START_FILL_RATIO;
use radio_protocol::{
    ControlMessage, DesyncError, Ingest, Playback, PlaybackPolicy, PlaybackState, RexmitScheduler,
};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default time between lookups
pub const DEFAULT_LOOKUP_INTERVAL: Duration = Duration::from_secs(5);

/// Default retransmission batching window
pub const DEFAULT_REXMIT_WINDOW: Duration = Duration::from_millis(250);

/// Receiver settings
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    /// Where lookups are sent (usually the broadcast address and control port)
    pub discover_addr: SocketAddr,
    /// Playback buffer and start policy
    pub policy: PlaybackPolicy,
    /// Retransmission batching window
    pub rexmit_window: Duration,
    /// Preferred station name
    pub name_filter: Option<String>,
    /// Time between lookups
    pub lookup_interval: Duration,
    /// Silence after which a station is dropped
    pub station_timeout: Duration,
}

impl ReceiverOptions {
    /// Defaults for lookups sent to `discover_addr`
    pub fn new(discover_addr: SocketAddr) -> Self {
        ReceiverOptions {
            discover_addr,
            policy: PlaybackPolicy::default(),
            rexmit_window: DEFAULT_REXMIT_WINDOW,
            name_filter: None,
            lookup_interval: DEFAULT_LOOKUP_INTERVAL,
            station_timeout: DEFAULT_STATION_TIMEOUT,
        }
    }

    /// Check the options before any unit starts
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.discover_addr.port() == 0 {
            return Err(EngineError::InvalidOption("control port must not be 0".into()));
        }
        if self.policy.buffer_bytes == 0 {
            return Err(EngineError::InvalidOption("buffer size must not be 0".into()));
        }
        if !(0.0..=1.0).contains(&self.policy.start_fill_ratio) {
            return Err(EngineError::InvalidOption(format!(
                "start fill ratio must be within 0..=1 (default {})",
                DEFAULT_START_FILL_RATIO
            )));
        }
        if self.policy.max_lead == Some(0) {
            return Err(EngineError::InvalidOption("max lead must not be 0".into()));
        }
        if self.rexmit_window.as_millis() == 0 {
            return Err(EngineError::InvalidOption(
                "retransmission window must be at least 1 ms".into(),
            ));
        }
        if self.lookup_interval.is_zero() {
            return Err(EngineError::InvalidOption("lookup interval must not be 0".into()));
        }
        Ok(())
    }
}

/// Sockets used by the receiver
#[derive(Clone)]
pub struct ReceiverTransports {
    /// Broadcast-capable; sends lookups and receives replies (should time out reads)
    pub control: Arc<dyn DatagramTransport>,
    /// Sends repair requests
    pub rexmit: Arc<dyn DatagramTransport>,
    /// Joins the active station's group (should time out reads)
    pub data: Arc<dyn DatagramTransport>,
}

/// Receiver engine, ready to start
pub struct ReceiverEngine {
    options: ReceiverOptions,
    transports: ReceiverTransports,
    tuner: Arc<Tuner>,
    scheduler: Arc<RexmitScheduler>,
    stats: Arc<ReceiverStats>,
    shutdown: ShutdownSignal,
}

impl ReceiverEngine {
    /// Create a receiver
    pub fn new(
        options: ReceiverOptions,
        transports: ReceiverTransports,
        shutdown: ShutdownSignal,
    ) -> Result<Self, EngineError> {
        options.validate()?;

        let directory = Arc::new(StationDirectory::new(options.station_timeout));
        let selector = Arc::new(StationSelector::new(Arc::clone(&transports.data)));
        let tuner = Arc::new(Tuner::new(
            directory,
            selector,
            options.name_filter.clone(),
        ));
        let scheduler = Arc::new(RexmitScheduler::new(options.rexmit_window));

        Ok(ReceiverEngine {
            options,
            transports,
            tuner,
            scheduler,
            stats: Arc::new(ReceiverStats::default()),
            shutdown,
        })
    }

    /// Navigation surface for a user interface
    pub fn navigator(&self) -> Arc<dyn StationNavigator> {
        Arc::clone(&self.tuner) as Arc<dyn StationNavigator>
    }

    /// Start every unit; audio is written to `output`
    pub fn start<W>(self, output: W) -> Result<ReceiverHandle, EngineError>
    where
        W: Write + Send + 'static,
    {
        // Subscribe before anything can select a station
        let signals = self.tuner.selector().subscribe();
        let mut threads = Vec::with_capacity(4);

        threads.push(spawn("lookup-maintenance", {
            let unit = LookupUnit {
                control: Arc::clone(&self.transports.control),
                discover_addr: self.options.discover_addr,
                interval: self.options.lookup_interval,
                tuner: Arc::clone(&self.tuner),
                scheduler: Arc::clone(&self.scheduler),
                shutdown: self.shutdown.clone(),
            };
            move || unit.run()
        })?);

        threads.push(spawn("reply-listener", {
            let control = Arc::clone(&self.transports.control);
            let tuner = Arc::clone(&self.tuner);
            let shutdown = self.shutdown.clone();
            move || reply_listener(control, tuner, shutdown)
        })?);

        threads.push(spawn("rexmit-flusher", {
            let rexmit = Arc::clone(&self.transports.rexmit);
            let scheduler = Arc::clone(&self.scheduler);
            let stats = Arc::clone(&self.stats);
            let shutdown = self.shutdown.clone();
            move || rexmit_flusher(rexmit, scheduler, stats, shutdown)
        })?);

        threads.push(spawn("playback", {
            let unit = PlaybackUnit {
                playback: Playback::new(self.options.policy.clone()),
                data: Arc::clone(&self.transports.data),
                signals,
                tuner: Arc::clone(&self.tuner),
                scheduler: Arc::clone(&self.scheduler),
                stats: Arc::clone(&self.stats),
                shutdown: self.shutdown.clone(),
            };
            move || unit.run(output)
        })?);

        info!("Receiver started, looking up stations at {}", self.options.discover_addr);

        Ok(ReceiverHandle {
            threads,
            tuner: self.tuner,
            stats: self.stats,
        })
    }
}

/// A started receiver
pub struct ReceiverHandle {
    threads: Vec<JoinHandle<()>>,
    tuner: Arc<Tuner>,
    stats: Arc<ReceiverStats>,
}

impl ReceiverHandle {
    /// Navigation surface for a user interface
    pub fn navigator(&self) -> Arc<dyn StationNavigator> {
        Arc::clone(&self.tuner) as Arc<dyn StationNavigator>
    }

    /// Directory, selector and filter
    pub fn tuner(&self) -> &Arc<Tuner> {
        &self.tuner
    }

    /// Shared statistics
    pub fn stats(&self) -> Arc<ReceiverStats> {
        Arc::clone(&self.stats)
    }

    /// Wait for every unit to stop (after shutdown was triggered)
    pub fn join(self) {
        for handle in self.threads {
            if handle.join().is_err() {
                error!("A receiver unit panicked");
            }
        }
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

struct LookupUnit {
    control: Arc<dyn DatagramTransport>,
    discover_addr: SocketAddr,
    interval: Duration,
    tuner: Arc<Tuner>,
    scheduler: Arc<RexmitScheduler>,
    shutdown: ShutdownSignal,
}

impl LookupUnit {
    fn run(self) {
        let lookup = ControlMessage::Lookup.to_bytes();

        loop {
            if let Err(e) = self.control.send_to(&lookup, self.discover_addr) {
                warn!("Failed to send lookup to {}: {}", self.discover_addr, e);
            }

            match self.tuner.maintain(Instant::now()) {
                Ok(eviction) => {
                    for name in &eviction.vanished {
                        let dropped = self.scheduler.forget_station(name);
                        if dropped > 0 {
                            debug!("Dropped {} queued repair ranges of '{}'", dropped, name);
                        }
                    }
                }
                Err(e) => warn!("Failed to switch station after eviction: {}", e),
            }

            if self.shutdown.wait_timeout(self.interval) {
                break;
            }
        }
    }
}

fn reply_listener(
    control: Arc<dyn DatagramTransport>,
    tuner: Arc<Tuner>,
    shutdown: ShutdownSignal,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    while !shutdown.is_triggered() {
        let (n, from) = match control.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                warn!("Reply listener receive error: {}", e);
                continue;
            }
        };

        match ControlMessage::parse(&buf[..n]) {
            Ok(ControlMessage::Reply(announcement)) => {
                debug!("Reply from {}: '{}'", from, announcement.name);
                if let Err(e) = tuner.ingest_reply(&announcement, from, Instant::now()) {
                    warn!("Failed to select '{}': {}", announcement.name, e);
                }
            }
            Ok(_) => debug!("Ignoring non-reply message from {}", from),
            Err(e) => debug!("Ignoring control message from {}: {}", from, e),
        }
    }
}

fn rexmit_flusher(
    rexmit: Arc<dyn DatagramTransport>,
    scheduler: Arc<RexmitScheduler>,
    stats: Arc<ReceiverStats>,
    shutdown: ShutdownSignal,
) {
    let mut last_ms = unix_millis();

    while !shutdown.wait_timeout(Duration::from_millis(1)) {
        let now_ms = unix_millis();
        for batch in scheduler.flush_due(last_ms, now_ms) {
            for datagram in batch.encode() {
                match rexmit.send_to(&datagram, batch.control) {
                    Ok(_) => stats.repair_request_sent(),
                    Err(e) => warn!("Failed to send repair request to {}: {}", batch.control, e),
                }
            }
            debug!(
                "Requested {} packets of '{}' from {}",
                batch.ids.len(),
                batch.station,
                batch.control
            );
        }
        last_ms = now_ms.max(last_ms);
    }
}

struct PlaybackUnit {
    playback: Playback,
    data: Arc<dyn DatagramTransport>,
    signals: Receiver<PlaybackSignal>,
    tuner: Arc<Tuner>,
    scheduler: Arc<RexmitScheduler>,
    stats: Arc<ReceiverStats>,
    shutdown: ShutdownSignal,
}

impl PlaybackUnit {
    fn run<W: Write>(mut self, mut output: W) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut halted = true;
        let poll = Duration::from_millis(100);

        while !self.shutdown.is_triggered() {
            if halted {
                match self.signals.recv_timeout(poll) {
                    Ok(PlaybackSignal::Resume) => {
                        self.playback.reset();
                        halted = false;
                    }
                    Ok(PlaybackSignal::Halt) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                continue;
            }

            // Poll boundary: follow station switches before touching the socket
            for signal in self.signals.try_iter() {
                self.playback.reset();
                halted = signal == PlaybackSignal::Halt;
            }
            if halted {
                debug!("Playback halted");
                continue;
            }

            let received = match self.data.recv_from(&mut buf) {
                Ok((n, _)) => Some(n),
                Err(e) if e.is_timeout() => None,
                Err(e) => {
                    warn!("Data receive error: {}", e);
                    None
                }
            };

            if let Err(e) = self.step(received.map(|n| &buf[..n]), &mut output) {
                error!("Output failed, stopping playback: {}", e);
                break;
            }
        }
        let _ = output.flush();
    }

    /// Handle one receive attempt and play at most one frame
    ///
    /// A timed out attempt still plays the next due frame. An ignored
    /// datagram plays nothing.
    fn step<W: Write>(&mut self, datagram: Option<&[u8]>, output: &mut W) -> std::io::Result<()> {
        if let Some(datagram) = datagram {
            if !self.ingest(datagram) {
                return Ok(());
            }
        }
        self.play_one(output)
    }

    /// Returns false when the datagram was ignored
    fn ingest(&mut self, datagram: &[u8]) -> bool {
        self.stats.datagram_received();

        match self.playback.on_datagram(datagram) {
            Ok(Ingest::Started { .. }) | Ok(Ingest::Superseded { .. }) => {
                self.stats.session_started();
            }
            Ok(Ingest::Gap(gap)) => {
                self.stats.gap_detected();
                let payload_size = self.playback.buffer().map_or(0, |b| b.payload_size());
                if let Some(active) = self.tuner.selector().active() {
                    debug!("Missing {} from '{}'", gap, active.name);
                    self.scheduler.register(
                        &active.name,
                        active.control,
                        gap,
                        payload_size,
                        unix_millis(),
                    );
                }
            }
            Ok(Ingest::Stored) => {}
            Ok(Ingest::Ignored(reason)) => {
                debug!("Ignored datagram: {:?}", reason);
                return false;
            }
            Err(e) => self.desync(e),
        }
        true
    }

    fn play_one<W: Write>(&mut self, output: &mut W) -> std::io::Result<()> {
        if self.playback.state() != PlaybackState::Playing {
            return Ok(());
        }
        match self.playback.next_frame() {
            Ok(Some(frame)) => {
                output.write_all(&frame)?;
                self.stats.frame_played();
            }
            Ok(None) => {}
            Err(e) => {
                self.desync(e);
                output.flush()?;
            }
        }
        Ok(())
    }

    fn desync(&self, e: DesyncError) {
        self.stats.desync();
        warn!("Playback desync, restarting: {}", e);
    }
}
