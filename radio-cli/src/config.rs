//! Configuration file support for the radio CLI tools
//!
//! Both binaries accept a TOML file; command line flags override its values.

use radio::protocol::control::MAX_NAME_LEN;
use radio::protocol::MAX_PAYLOAD_SIZE;
use radio::receiver::{DEFAULT_LOOKUP_INTERVAL, DEFAULT_REXMIT_WINDOW};
use radio::{PlaybackPolicy, ReceiverOptions, SenderOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

/// Sender configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Input source (file path or "-" for stdin)
    #[serde(default = "default_stdio")]
    pub input: String,
    /// Multicast group the audio is sent to
    pub mcast_addr: Option<Ipv4Addr>,
    /// Data port
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    /// Control port lookups arrive on
    #[serde(default = "default_ctrl_port")]
    pub ctrl_port: u16,
    /// Audio bytes per packet
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,
    /// Bytes of audio kept for repairs
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Transmission cycle length in milliseconds
    #[serde(default = "default_cadence_ms")]
    pub cadence_ms: u64,
    /// Station name
    #[serde(default = "default_name")]
    pub name: String,
    /// Multicast TTL
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    /// Statistics interval in seconds (0 disables)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

/// Receiver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Output destination (file path or "-" for stdout)
    #[serde(default = "default_stdio")]
    pub output: String,
    /// Address lookups are sent to
    #[serde(default = "default_discover_addr")]
    pub discover_addr: Ipv4Addr,
    /// Control port of the senders
    #[serde(default = "default_ctrl_port")]
    pub ctrl_port: u16,
    /// Playback buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Retransmission batching window in milliseconds
    #[serde(default = "default_rexmit_window_ms")]
    pub rexmit_window_ms: u64,
    /// Preferred station
    pub name: Option<String>,
    /// Share of the buffer filled before playback starts
    #[serde(default = "default_start_fill_ratio")]
    pub start_fill_ratio: f64,
    /// Slots a packet may run ahead of playback (default: buffer capacity)
    pub max_lead: Option<usize>,
    /// Seconds between lookups
    #[serde(default = "default_lookup_interval_secs")]
    pub lookup_interval_secs: u64,
    /// Statistics interval in seconds (0 disables)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_stdio() -> String {
    "-".to_string()
}

fn default_data_port() -> u16 {
    25826
}

fn default_ctrl_port() -> u16 {
    35826
}

fn default_payload_size() -> usize {
    512
}

fn default_history_size() -> usize {
    128000
}

fn default_cadence_ms() -> u64 {
    250
}

fn default_name() -> String {
    "Unnamed Station".to_string()
}

fn default_ttl() -> u32 {
    4
}

fn default_stats_interval() -> u64 {
    0
}

fn default_discover_addr() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}

fn default_buffer_size() -> usize {
    65536
}

fn default_rexmit_window_ms() -> u64 {
    DEFAULT_REXMIT_WINDOW.as_millis() as u64
}

fn default_start_fill_ratio() -> f64 {
    0.75
}

fn default_lookup_interval_secs() -> u64 {
    DEFAULT_LOOKUP_INTERVAL.as_secs()
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            input: default_stdio(),
            mcast_addr: None,
            data_port: default_data_port(),
            ctrl_port: default_ctrl_port(),
            payload_size: default_payload_size(),
            history_size: default_history_size(),
            cadence_ms: default_cadence_ms(),
            name: default_name(),
            ttl: default_ttl(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            output: default_stdio(),
            discover_addr: default_discover_addr(),
            ctrl_port: default_ctrl_port(),
            buffer_size: default_buffer_size(),
            rexmit_window_ms: default_rexmit_window_ms(),
            name: None,
            start_fill_ratio: default_start_fill_ratio(),
            max_lead: None,
            lookup_interval_secs: default_lookup_interval_secs(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

/// Combined configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Sender configuration
    pub sender: Option<SenderConfig>,
    /// Receiver configuration
    pub receiver: Option<ReceiverConfig>,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Create example sender configuration
    pub fn example_sender() -> Self {
        Config {
            sender: Some(SenderConfig {
                mcast_addr: Some(Ipv4Addr::new(239, 10, 11, 12)),
                name: "Radio Example".to_string(),
                stats_interval_secs: 10,
                ..SenderConfig::default()
            }),
            receiver: None,
        }
    }

    /// Create example receiver configuration
    pub fn example_receiver() -> Self {
        Config {
            sender: None,
            receiver: Some(ReceiverConfig {
                name: Some("Radio Example".to_string()),
                stats_interval_secs: 10,
                ..ReceiverConfig::default()
            }),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn invalid<T>(msg: impl Into<String>) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid(msg.into()))
}

impl SenderConfig {
    /// Reject values no engine could run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.mcast_addr {
            None => return invalid("multicast address is required"),
            Some(ip) if !ip.is_multicast() => {
                return invalid(format!("{} is not a multicast address", ip))
            }
            Some(_) => {}
        }
        if self.data_port == 0 || self.ctrl_port == 0 {
            return invalid("ports must not be 0");
        }
        if self.payload_size == 0 || self.payload_size > MAX_PAYLOAD_SIZE {
            return invalid(format!("payload size must be within 1..={}", MAX_PAYLOAD_SIZE));
        }
        if self.history_size == 0 {
            return invalid("history size must not be 0");
        }
        if self.cadence_ms == 0 {
            return invalid("cadence must not be 0");
        }
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return invalid(format!("station name must be 1 to {} bytes", MAX_NAME_LEN));
        }
        Ok(())
    }

    /// Engine options
    pub fn to_options(&self) -> Result<SenderOptions, ConfigError> {
        self.validate()?;
        let ip = self
            .mcast_addr
            .ok_or_else(|| ConfigError::Invalid("multicast address is required".into()))?;

        Ok(SenderOptions {
            data_addr: SocketAddrV4::new(ip, self.data_port),
            name: self.name.clone(),
            payload_size: self.payload_size,
            history_bytes: self.history_size,
            cadence: Duration::from_millis(self.cadence_ms),
            session_id: None,
        })
    }

    /// Get statistics interval as Duration
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

impl ReceiverConfig {
    /// Reject values no engine could run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ctrl_port == 0 {
            return invalid("control port must not be 0");
        }
        if self.buffer_size == 0 {
            return invalid("buffer size must not be 0");
        }
        if self.rexmit_window_ms == 0 {
            return invalid("retransmission window must not be 0");
        }
        if !(0.0..=1.0).contains(&self.start_fill_ratio) {
            return invalid("start fill ratio must be within 0..=1");
        }
        if self.max_lead == Some(0) {
            return invalid("max lead must not be 0");
        }
        if self.lookup_interval_secs == 0 {
            return invalid("lookup interval must not be 0");
        }
        if let Some(name) = &self.name {
            if name.is_empty() || name.len() > MAX_NAME_LEN {
                return invalid(format!("station name must be 1 to {} bytes", MAX_NAME_LEN));
            }
        }
        Ok(())
    }

    /// Engine options
    pub fn to_options(&self) -> Result<ReceiverOptions, ConfigError> {
        self.validate()?;

        let mut options =
            ReceiverOptions::new(SocketAddr::from((self.discover_addr, self.ctrl_port)));
        options.policy = PlaybackPolicy {
            buffer_bytes: self.buffer_size,
            start_fill_ratio: self.start_fill_ratio,
            max_lead: self.max_lead,
        };
        options.rexmit_window = Duration::from_millis(self.rexmit_window_ms);
        options.name_filter = self.name.clone();
        options.lookup_interval = Duration::from_secs(self.lookup_interval_secs);
        Ok(options)
    }

    /// Get statistics interval as Duration
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}
