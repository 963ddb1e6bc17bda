//! In-memory datagram network
//!
//! A lossy stand-in for UDP used by engine tests. Endpoints are addressed by
//! `SocketAddr`; a datagram to `255.255.255.255:port` reaches every endpoint
//! bound to `port`, a datagram to a multicast group reaches every endpoint that
//! joined it. A loss filter decides deterministically which datagrams vanish.

use crate::socket::{DatagramTransport, SocketError};
use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Loss filter: returns `true` for datagrams that should be dropped
///
/// Called with the source, the destination endpoint and the payload.
pub type LossFilter = Arc<dyn Fn(SocketAddr, SocketAddr, &[u8]) -> bool + Send + Sync>;

type Datagram = (Bytes, SocketAddr);

struct Endpoint {
    queue: Sender<Datagram>,
    group: Option<SocketAddrV4>,
}

struct Fabric {
    endpoints: RwLock<HashMap<SocketAddr, Endpoint>>,
    loss: RwLock<Option<LossFilter>>,
    next_port: AtomicU16,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Shared in-memory network
#[derive(Clone)]
pub struct MemoryNetwork {
    fabric: Arc<Fabric>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        MemoryNetwork::new()
    }
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        MemoryNetwork {
            fabric: Arc::new(Fabric {
                endpoints: RwLock::new(HashMap::new()),
                loss: RwLock::new(None),
                next_port: AtomicU16::new(49152),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Bind an endpoint
    ///
    /// An unspecified IP becomes `127.0.0.1`; port 0 picks an ephemeral port.
    pub fn bind(&self, addr: SocketAddr) -> Result<MemoryTransport, SocketError> {
        let ip = match addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            ip => ip,
        };

        let mut endpoints = self.fabric.endpoints.write();
        let local = if addr.port() == 0 {
            loop {
                let port = self.fabric.next_port.fetch_add(1, Ordering::Relaxed).max(49152);
                let candidate = SocketAddr::new(ip, port);
                if !endpoints.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            SocketAddr::new(ip, addr.port())
        };

        if endpoints.contains_key(&local) {
            return Err(SocketError::Io(io::Error::from(ErrorKind::AddrInUse)));
        }

        let (queue, inbox) = channel::unbounded();
        endpoints.insert(local, Endpoint { queue, group: None });

        Ok(MemoryTransport {
            fabric: Arc::clone(&self.fabric),
            local,
            inbox,
            read_timeout: Mutex::new(None),
        })
    }

    /// Install a loss filter, replacing the previous one
    pub fn set_loss<F>(&self, filter: F)
    where
        F: Fn(SocketAddr, SocketAddr, &[u8]) -> bool + Send + Sync + 'static,
    {
        *self.fabric.loss.write() = Some(Arc::new(filter));
    }

    /// Remove the loss filter
    pub fn clear_loss(&self) {
        *self.fabric.loss.write() = None;
    }

    /// Datagrams delivered so far
    pub fn delivered(&self) -> u64 {
        self.fabric.delivered.load(Ordering::Relaxed)
    }

    /// Datagrams dropped by the loss filter so far
    pub fn dropped(&self) -> u64 {
        self.fabric.dropped.load(Ordering::Relaxed)
    }
}

impl Fabric {
    fn route(&self, from: SocketAddr, target: SocketAddr, payload: &[u8]) {
        let endpoints = self.endpoints.read();
        let loss = self.loss.read().clone();

        let recipients: Vec<(&SocketAddr, &Endpoint)> = match target {
            SocketAddr::V4(v4) if v4.ip().is_broadcast() => endpoints
                .iter()
                .filter(|(addr, _)| addr.port() == v4.port() && **addr != from)
                .collect(),
            SocketAddr::V4(v4) if v4.ip().is_multicast() => endpoints
                .iter()
                .filter(|(_, endpoint)| endpoint.group == Some(v4))
                .collect(),
            _ => endpoints.get_key_value(&target).into_iter().collect(),
        };

        let bytes = Bytes::copy_from_slice(payload);
        for (addr, endpoint) in recipients {
            if loss.as_ref().map_or(false, |lose| lose(from, *addr, payload)) {
                trace!("Dropping {} byte datagram {} -> {}", payload.len(), from, addr);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if endpoint.queue.send((bytes.clone(), from)).is_ok() {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Endpoint on a [`MemoryNetwork`]
pub struct MemoryTransport {
    fabric: Arc<Fabric>,
    local: SocketAddr,
    inbox: Receiver<Datagram>,
    read_timeout: Mutex<Option<Duration>>,
}

impl MemoryTransport {
    /// Bound reads with a timeout (`None` blocks)
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self.read_timeout.lock() = timeout;
    }

    /// Currently joined group
    pub fn group(&self) -> Option<SocketAddrV4> {
        self.fabric
            .endpoints
            .read()
            .get(&self.local)
            .and_then(|endpoint| endpoint.group)
    }

    /// Number of datagrams waiting to be read
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }
}

impl DatagramTransport for MemoryTransport {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        self.fabric.route(self.local, target, buf);
        Ok(buf.len())
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        let timeout = *self.read_timeout.lock();
        let (bytes, from) = match timeout {
            Some(timeout) => match self.inbox.recv_timeout(timeout) {
                Ok(datagram) => datagram,
                Err(RecvTimeoutError::Timeout) => return Err(SocketError::timed_out()),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SocketError::Io(io::Error::from(ErrorKind::NotConnected)))
                }
            },
            None => self
                .inbox
                .recv()
                .map_err(|_| SocketError::Io(io::Error::from(ErrorKind::NotConnected)))?,
        };

        // Longer datagrams are truncated like UDP does
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok((n, from))
    }

    fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.local)
    }

    fn join_multicast(&self, group: SocketAddrV4) -> Result<(), SocketError> {
        if !group.ip().is_multicast() {
            return Err(SocketError::NotMulticast(*group.ip()));
        }
        if let Some(endpoint) = self.fabric.endpoints.write().get_mut(&self.local) {
            endpoint.group = Some(group);
        }
        Ok(())
    }

    fn leave_multicast(&self) -> Result<(), SocketError> {
        if let Some(endpoint) = self.fabric.endpoints.write().get_mut(&self.local) {
            endpoint.group = None;
        }
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.fabric.endpoints.write().remove(&self.local);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_unicast_delivery() {
        let net = MemoryNetwork::new();
        let a = net.bind(addr("10.0.0.1:1000")).unwrap();
        let b = net.bind(addr("10.0.0.2:2000")).unwrap();
        b.set_read_timeout(Some(Duration::from_millis(100)));

        a.send_to(b"hello", addr("10.0.0.2:2000")).unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, addr("10.0.0.1:1000"));
    }

    #[test]
    fn test_bind_conflict_and_ephemeral() {
        let net = MemoryNetwork::new();
        let _a = net.bind(addr("10.0.0.1:1000")).unwrap();
        assert!(net.bind(addr("10.0.0.1:1000")).is_err());

        let eph = net.bind(addr("0.0.0.0:0")).unwrap();
        let local = eph.local_addr().unwrap();
        assert_eq!(local.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(local.port() >= 49152);
    }

    #[test]
    fn test_broadcast_reaches_port() {
        let net = MemoryNetwork::new();
        let client = net.bind(addr("10.0.0.9:0")).unwrap();
        let s1 = net.bind(addr("10.0.0.1:35826")).unwrap();
        let s2 = net.bind(addr("10.0.0.2:35826")).unwrap();
        let other = net.bind(addr("10.0.0.3:1234")).unwrap();

        client
            .send_to(b"ZERO_SEVEN_COME_IN\n", addr("255.255.255.255:35826"))
            .unwrap();
        assert_eq!(s1.pending(), 1);
        assert_eq!(s2.pending(), 1);
        assert_eq!(other.pending(), 0);
    }

    #[test]
    fn test_multicast_membership() {
        let net = MemoryNetwork::new();
        let sender = net.bind(addr("10.0.0.1:0")).unwrap();
        let rx = net.bind(addr("10.0.0.2:0")).unwrap();
        let group: SocketAddrV4 = "239.10.11.12:25826".parse().unwrap();

        sender.send_to(b"x", SocketAddr::V4(group)).unwrap();
        assert_eq!(rx.pending(), 0);

        rx.join_multicast(group).unwrap();
        assert_eq!(rx.group(), Some(group));
        sender.send_to(b"x", SocketAddr::V4(group)).unwrap();
        assert_eq!(rx.pending(), 1);

        rx.leave_multicast().unwrap();
        sender.send_to(b"x", SocketAddr::V4(group)).unwrap();
        assert_eq!(rx.pending(), 1);
    }

    #[test]
    fn test_loss_filter() {
        let net = MemoryNetwork::new();
        let a = net.bind(addr("10.0.0.1:1")).unwrap();
        let b = net.bind(addr("10.0.0.2:2")).unwrap();
        net.set_loss(|_, _, payload| payload[0] == 0);

        a.send_to(&[0], addr("10.0.0.2:2")).unwrap();
        a.send_to(&[1], addr("10.0.0.2:2")).unwrap();
        assert_eq!(b.pending(), 1);
        assert_eq!(net.dropped(), 1);
        assert_eq!(net.delivered(), 1);

        net.clear_loss();
        a.send_to(&[0], addr("10.0.0.2:2")).unwrap();
        assert_eq!(b.pending(), 2);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn drain(rx: &MemoryTransport) -> Vec<Vec<u8>> {
            let mut buf = [0u8; 64];
            (0..rx.pending())
                .map(|_| {
                    let (n, _) = rx.recv_from(&mut buf).unwrap();
                    buf[..n].to_vec()
                })
                .collect()
        }

        proptest! {
            #[test]
            fn prop_group_members_see_kept_datagrams_in_order(
                datagrams in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..32), 0..40),
            ) {
                let net = MemoryNetwork::new();
                let group: SocketAddrV4 = "239.10.11.12:25826".parse().unwrap();
                let sender = net.bind(addr("10.0.0.1:0")).unwrap();
                let clean = net.bind(addr("10.0.0.2:0")).unwrap();
                let lossy = net.bind(addr("10.0.0.3:0")).unwrap();
                let outsider = net.bind(addr("10.0.0.4:0")).unwrap();
                clean.join_multicast(group).unwrap();
                lossy.join_multicast(group).unwrap();
                clean.set_read_timeout(Some(Duration::from_millis(10)));
                lossy.set_read_timeout(Some(Duration::from_millis(10)));

                let lossy_addr = lossy.local_addr().unwrap();
                net.set_loss(move |_, to, payload| to == lossy_addr && payload[0] % 3 == 0);

                for datagram in &datagrams {
                    sender.send_to(datagram, SocketAddr::V4(group)).unwrap();
                }

                let kept: Vec<Vec<u8>> = datagrams.iter().filter(|d| d[0] % 3 != 0).cloned().collect();
                prop_assert_eq!(drain(&clean), datagrams.clone());
                prop_assert_eq!(drain(&lossy), kept.clone());
                prop_assert_eq!(outsider.pending(), 0);
                prop_assert_eq!(net.dropped() as usize, datagrams.len() - kept.len());
                prop_assert_eq!(net.delivered() as usize, datagrams.len() + kept.len());
            }
        }
    }

    #[test]
    fn test_read_timeout() {
        let net = MemoryNetwork::new();
        let a = net.bind(addr("10.0.0.1:1")).unwrap();
        a.set_read_timeout(Some(Duration::from_millis(5)));
        let mut buf = [0u8; 4];
        assert!(a.recv_from(&mut buf).unwrap_err().is_timeout());
    }
}
