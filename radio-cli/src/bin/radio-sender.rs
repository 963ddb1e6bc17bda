//! Radio Sender - multicast audio station
//!
//! Reads raw audio from stdin or a file and multicasts it, answering
//! discovery lookups and repair requests on the control port.

use clap::Parser;
use radio::io::{RadioSocket, Timer};
use radio::{shutdown_channel, SenderEngine, SenderTransports};
use radio_cli::config::{Config, SenderConfig};
use radio_cli::stats::format_sender_stats;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Control socket read timeout
const CTRL_READ_TIMEOUT: Duration = Duration::from_millis(300);

#[derive(Parser, Debug)]
#[command(name = "radio-sender")]
#[command(about = "Multicast audio sender", long_about = None)]
struct Args {
    /// Configuration file (TOML, [sender] table)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input source: file path or '-' for stdin
    #[arg(short, long)]
    input: Option<String>,

    /// Multicast address the audio is sent to
    #[arg(short = 'a', long)]
    mcast_addr: Option<Ipv4Addr>,

    /// Data port
    #[arg(short = 'P', long)]
    data_port: Option<u16>,

    /// Control port
    #[arg(short = 'C', long)]
    ctrl_port: Option<u16>,

    /// Audio bytes per packet
    #[arg(short = 'p', long)]
    payload_size: Option<usize>,

    /// Bytes of audio kept for repairs
    #[arg(short = 'f', long)]
    history_size: Option<usize>,

    /// Transmission cycle in milliseconds
    #[arg(short = 'R', long)]
    cadence_ms: Option<u64>,

    /// Station name
    #[arg(short, long)]
    name: Option<String>,

    /// Multicast TTL
    #[arg(long)]
    ttl: Option<u32>,

    /// Statistics interval in seconds (0 disables)
    #[arg(long)]
    stats: Option<u64>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<SenderConfig> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?.sender.unwrap_or_default(),
            None => SenderConfig::default(),
        };

        if let Some(input) = self.input {
            config.input = input;
        }
        if let Some(addr) = self.mcast_addr {
            config.mcast_addr = Some(addr);
        }
        if let Some(port) = self.data_port {
            config.data_port = port;
        }
        if let Some(port) = self.ctrl_port {
            config.ctrl_port = port;
        }
        if let Some(size) = self.payload_size {
            config.payload_size = size;
        }
        if let Some(size) = self.history_size {
            config.history_size = size;
        }
        if let Some(cadence) = self.cadence_ms {
            config.cadence_ms = cadence;
        }
        if let Some(name) = self.name {
            config.name = name;
        }
        if let Some(ttl) = self.ttl {
            config.ttl = ttl;
        }
        if let Some(stats) = self.stats {
            config.stats_interval_secs = stats;
        }

        config.validate()?;
        Ok(config)
    }
}

fn open_input(input: &str) -> anyhow::Result<Box<dyn Read + Send>> {
    if input == "-" {
        tracing::info!("Reading audio from stdin");
        Ok(Box::new(io::stdin()))
    } else {
        tracing::info!("Reading audio from {}", input);
        let file = File::open(input)
            .map_err(|e| anyhow::anyhow!("Failed to open input '{}': {}", input, e))?;
        Ok(Box::new(BufReader::new(file)))
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let config = Args::parse().into_config()?;
    let options = config.to_options()?;

    let data = RadioSocket::sender(config.ttl)?;

    let lookup = RadioSocket::bind_broadcast(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.ctrl_port)))?;
    lookup.set_read_timeout(Some(CTRL_READ_TIMEOUT))?;

    let reply = RadioSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
    reply.set_read_timeout(Some(CTRL_READ_TIMEOUT))?;
    tracing::info!(
        "Control port {}, repair requests on {}",
        config.ctrl_port,
        reply.as_socket().local_addr()?
    );

    let transports = SenderTransports {
        data: Arc::new(data),
        lookup: Arc::new(lookup),
        reply: Arc::new(reply),
    };

    let (trigger, shutdown) = shutdown_channel();
    let mut engine = SenderEngine::new(options, transports, shutdown.clone())?;
    let mut units = engine.spawn_listeners()?;

    if config.stats_interval_secs > 0 {
        let stats = engine.stats();
        let payload_size = config.payload_size;
        let interval = config.stats_interval();
        let shutdown = shutdown.clone();
        units.push(thread::spawn(move || {
            let started = Instant::now();
            let mut timer = Timer::new(interval);
            while !shutdown.wait_timeout(timer.time_until_expiration()) {
                if timer.try_fire() {
                    tracing::info!(
                        "{}",
                        format_sender_stats(&stats.snapshot(), payload_size, started.elapsed())
                    );
                }
            }
        }));
    }

    let input = open_input(&config.input)?;
    let result = engine.run(input);

    trigger.trigger();
    for unit in units {
        let _ = unit.join();
    }

    let sent = result?;
    tracing::info!(
        "{}",
        format_sender_stats(&engine.stats().snapshot(), config.payload_size, Duration::ZERO)
    );
    tracing::info!("Sender finished after {} packets", sent);
    Ok(())
}
