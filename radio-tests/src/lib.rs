//! Shared fixtures for the workspace tests
//!
//! Everything here runs over [`MemoryNetwork`], so whole sender/receiver
//! setups fit in one process without touching real sockets.

use parking_lot::Mutex;
use radio::{ReceiverTransports, SenderTransports};
use radio_io::MemoryNetwork;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Control port every test sender listens on
pub const CTRL_PORT: u16 = 35826;

/// Read timeout used by every test transport
pub const POLL: Duration = Duration::from_millis(20);

/// Parse a socket address literal
pub fn addr(s: &str) -> SocketAddr {
    s.parse().expect("valid socket address")
}

/// Transports of a sender living at `ip`
pub fn sender_transports(net: &MemoryNetwork, ip: &str) -> SenderTransports {
    let data = net.bind(addr(&format!("{}:0", ip))).expect("bind data");
    let lookup = net
        .bind(addr(&format!("{}:{}", ip, CTRL_PORT)))
        .expect("bind lookup");
    lookup.set_read_timeout(Some(POLL));
    let reply = net.bind(addr(&format!("{}:0", ip))).expect("bind reply");
    reply.set_read_timeout(Some(POLL));

    SenderTransports {
        data: Arc::new(data),
        lookup: Arc::new(lookup),
        reply: Arc::new(reply),
    }
}

/// Transports of a receiver living at `ip`
pub fn receiver_transports(net: &MemoryNetwork, ip: &str) -> ReceiverTransports {
    let control = net.bind(addr(&format!("{}:0", ip))).expect("bind control");
    control.set_read_timeout(Some(POLL));
    let rexmit = net.bind(addr(&format!("{}:0", ip))).expect("bind rexmit");
    let data = net.bind(addr(&format!("{}:0", ip))).expect("bind data");
    data.set_read_timeout(Some(POLL));

    ReceiverTransports {
        control: Arc::new(control),
        rexmit: Arc::new(rexmit),
        data: Arc::new(data),
    }
}

/// Audio bytes with a recognizable, non-repeating pattern
pub fn audio(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Writer collecting everything into a shared vector
#[derive(Clone, Default)]
pub struct SharedSink {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedSink {
    /// Create an empty sink
    pub fn new() -> Self {
        SharedSink::default()
    }

    /// Copy of everything written so far
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    /// Check if nothing was written
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reader handing out at most `chunk` bytes per call, sleeping before each
///
/// Stands in for a live audio source.
pub struct PacedReader {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
    delay: Duration,
}

impl PacedReader {
    /// Serve `data` in `chunk` sized reads, one every `delay`
    pub fn new(data: Vec<u8>, chunk: usize, delay: Duration) -> Self {
        PacedReader {
            data,
            pos: 0,
            chunk: chunk.max(1),
            delay,
        }
    }
}

impl Read for PacedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.data.len() {
            return Ok(0);
        }
        thread::sleep(self.delay);
        let n = buf.len().min(self.chunk).min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
