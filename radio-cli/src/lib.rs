//! Radio CLI Library
//!
//! Shared functionality for the radio command-line tools.

pub mod config;
pub mod stats;

pub use config::{Config, ConfigError, ReceiverConfig, SenderConfig};
pub use stats::{format_bandwidth, format_bytes, format_receiver_stats, format_sender_stats};
