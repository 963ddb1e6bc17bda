//! Radio I/O and Platform Abstraction
//!
//! This crate provides the datagram transport used by the engines: socket2
//! backed UDP sockets, a rebinding multicast receive socket, an in-memory
//! lossy network for tests, and timing utilities.

pub mod memory;
pub mod socket;
pub mod time;

pub use memory::{LossFilter, MemoryNetwork, MemoryTransport};
pub use socket::{DatagramTransport, MulticastSocket, RadioSocket, SocketError};
pub use time::{unix_millis, unix_secs, Timer};
