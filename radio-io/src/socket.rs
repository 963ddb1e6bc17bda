//! UDP sockets for the radio
//!
//! Everything the engines need from the network goes through the
//! [`DatagramTransport`] trait: unicast/broadcast control traffic uses
//! [`RadioSocket`], the receiver's audio data uses [`MulticastSocket`], and
//! tests use the in-memory network from [`crate::memory`].

use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Socket errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid socket address")]
    InvalidAddress,

    #[error("Not a multicast group: {0}")]
    NotMulticast(Ipv4Addr),

    #[error("Socket has not joined a multicast group")]
    NotJoined,

    #[error("Socket option not supported on this transport")]
    UnsupportedOption,
}

impl SocketError {
    /// Check if this error only reports that a read timed out
    pub fn is_timeout(&self) -> bool {
        match self {
            SocketError::Io(e) => matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
            _ => false,
        }
    }

    pub(crate) fn timed_out() -> Self {
        SocketError::Io(io::Error::from(ErrorKind::WouldBlock))
    }
}

/// Datagram transport used by the engines
///
/// Reads honour the transport's read timeout: when nothing arrives in time
/// `recv_from` fails with an error for which [`SocketError::is_timeout`] holds.
pub trait DatagramTransport: Send + Sync {
    /// Send one datagram
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError>;

    /// Receive one datagram, returning its length and source
    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError>;

    /// Local address of the transport
    fn local_addr(&self) -> Result<SocketAddr, SocketError>;

    /// Join a multicast group, leaving any group joined before
    fn join_multicast(&self, _group: SocketAddrV4) -> Result<(), SocketError> {
        Err(SocketError::UnsupportedOption)
    }

    /// Leave the joined multicast group, if any
    fn leave_multicast(&self) -> Result<(), SocketError> {
        Ok(())
    }
}

fn udp_socket(addr: SocketAddr) -> Result<Socket, SocketError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    Ok(socket)
}

/// Plain UDP socket for control traffic and audio transmission
pub struct RadioSocket {
    inner: UdpSocket,
}

impl RadioSocket {
    /// Create a socket bound to the given address
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let socket = udp_socket(addr)?;
        socket.bind(&addr.into())?;

        Ok(RadioSocket {
            inner: socket.into(),
        })
    }

    /// Create a broadcast-enabled socket bound to the given address
    pub fn bind_broadcast(addr: SocketAddr) -> Result<Self, SocketError> {
        let socket = RadioSocket::bind(addr)?;
        socket.inner.set_broadcast(true)?;
        Ok(socket)
    }

    /// Create a sending socket on an ephemeral port with the given multicast TTL
    pub fn sender(multicast_ttl: u32) -> Result<Self, SocketError> {
        let socket = RadioSocket::bind_broadcast(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        socket.inner.set_multicast_ttl_v4(multicast_ttl)?;
        Ok(socket)
    }

    /// Bound reads with a timeout (`None` blocks)
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), SocketError> {
        self.inner.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Switch non-blocking mode
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), SocketError> {
        self.inner.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// Set the multicast TTL
    pub fn set_multicast_ttl(&self, ttl: u32) -> Result<(), SocketError> {
        self.inner.set_multicast_ttl_v4(ttl)?;
        Ok(())
    }

    /// Try to clone the socket
    pub fn try_clone(&self) -> Result<Self, SocketError> {
        Ok(RadioSocket {
            inner: self.inner.try_clone()?,
        })
    }

    /// Get a reference to the underlying socket
    pub fn as_socket(&self) -> &UdpSocket {
        &self.inner
    }
}

impl DatagramTransport for RadioSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.inner.send_to(buf, target)?)
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        Ok(self.inner.recv_from(buf)?)
    }

    fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.inner.local_addr()?)
    }
}

struct Membership {
    socket: UdpSocket,
    port: u16,
    group: Option<Ipv4Addr>,
}

/// Receiving socket for a station's multicast data group
///
/// The socket is bound to the group's port on first join and rebound only
/// when a later group uses a different port. Membership changes take the
/// write lock, so they wait for at most one pending read timeout.
pub struct MulticastSocket {
    state: RwLock<Option<Membership>>,
    read_timeout: Duration,
    interface: Ipv4Addr,
}

impl MulticastSocket {
    /// Create an unbound socket whose reads time out after `read_timeout`
    pub fn new(read_timeout: Duration) -> Self {
        MulticastSocket {
            state: RwLock::new(None),
            read_timeout,
            interface: Ipv4Addr::UNSPECIFIED,
        }
    }

    /// Use a specific local interface for group membership
    pub fn with_interface(mut self, interface: Ipv4Addr) -> Self {
        self.interface = interface;
        self
    }

    /// Join `group`, leaving the current group first
    pub fn join(&self, group: SocketAddrV4) -> Result<(), SocketError> {
        if !group.ip().is_multicast() {
            return Err(SocketError::NotMulticast(*group.ip()));
        }

        let mut state = self.state.write();

        let rebind = match state.as_mut() {
            Some(current) => {
                if let Some(old) = current.group.take() {
                    current.socket.leave_multicast_v4(&old, &self.interface)?;
                }
                if current.port != group.port() {
                    debug!("Rebinding data socket from port {} to {}", current.port, group.port());
                }
                current.port != group.port()
            }
            None => true,
        };

        if rebind {
            *state = None;
            *state = Some(self.bind_port(group.port())?);
        }

        if let Some(current) = state.as_mut() {
            current.socket.join_multicast_v4(group.ip(), &self.interface)?;
            current.group = Some(*group.ip());
        }
        info!("Joined multicast group {}", group);
        Ok(())
    }

    /// Leave the current group; the port stays bound
    pub fn leave(&self) -> Result<(), SocketError> {
        let mut state = self.state.write();
        if let Some(current) = state.as_mut() {
            if let Some(old) = current.group.take() {
                current.socket.leave_multicast_v4(&old, &self.interface)?;
                info!("Left multicast group {}:{}", old, current.port);
            }
        }
        Ok(())
    }

    /// Currently joined group
    pub fn group(&self) -> Option<SocketAddrV4> {
        self.state
            .read()
            .as_ref()
            .and_then(|m| m.group.map(|ip| SocketAddrV4::new(ip, m.port)))
    }

    fn bind_port(&self, port: u16) -> Result<Membership, SocketError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let socket = udp_socket(addr)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&addr.into())?;
        socket.set_read_timeout(Some(self.read_timeout))?;

        Ok(Membership {
            socket: socket.into(),
            port,
            group: None,
        })
    }
}

impl DatagramTransport for MulticastSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        let state = self.state.read();
        let membership = state.as_ref().ok_or(SocketError::NotJoined)?;
        Ok(membership.socket.send_to(buf, target)?)
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        {
            let state = self.state.read();
            if let Some(membership) = state.as_ref() {
                return Ok(membership.socket.recv_from(buf)?);
            }
        }
        // Nothing bound yet: behave like a read that timed out
        std::thread::sleep(self.read_timeout);
        Err(SocketError::timed_out())
    }

    fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        let state = self.state.read();
        let membership = state.as_ref().ok_or(SocketError::NotJoined)?;
        Ok(membership.socket.local_addr()?)
    }

    fn join_multicast(&self, group: SocketAddrV4) -> Result<(), SocketError> {
        self.join(group)
    }

    fn leave_multicast(&self) -> Result<(), SocketError> {
        self.leave()
    }
}
