//! Radio Receiver - multicast audio player
//!
//! Discovers stations, plays the selected one to stdout or a file and asks
//! the station for lost packets.

use clap::Parser;
use radio::io::{MulticastSocket, RadioSocket, Timer};
use radio::{shutdown_channel, ReceiverEngine, ReceiverTransports};
use radio_cli::config::{Config, ReceiverConfig};
use radio_cli::stats::format_receiver_stats;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Read timeout of the control and data sockets
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "radio-receiver")]
#[command(about = "Multicast audio receiver", long_about = None)]
struct Args {
    /// Configuration file (TOML, [receiver] table)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output file (use '-' for stdout)
    #[arg(short, long)]
    output: Option<String>,

    /// Address lookups are sent to
    #[arg(short = 'd', long)]
    discover_addr: Option<Ipv4Addr>,

    /// Control port
    #[arg(short = 'C', long)]
    ctrl_port: Option<u16>,

    /// Playback buffer size in bytes
    #[arg(short = 'b', long)]
    buffer_size: Option<usize>,

    /// Retransmission batching window in milliseconds
    #[arg(short = 'R', long)]
    rexmit_window_ms: Option<u64>,

    /// Preferred station name
    #[arg(short, long)]
    name: Option<String>,

    /// Share of the buffer filled before playback starts
    #[arg(long)]
    fill_ratio: Option<f64>,

    /// Slots a packet may run ahead of playback
    #[arg(long)]
    max_lead: Option<usize>,

    /// Statistics interval in seconds (0 disables)
    #[arg(long)]
    stats: Option<u64>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ReceiverConfig> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?.receiver.unwrap_or_default(),
            None => ReceiverConfig::default(),
        };

        if let Some(output) = self.output {
            config.output = output;
        }
        if let Some(addr) = self.discover_addr {
            config.discover_addr = addr;
        }
        if let Some(port) = self.ctrl_port {
            config.ctrl_port = port;
        }
        if let Some(size) = self.buffer_size {
            config.buffer_size = size;
        }
        if let Some(window) = self.rexmit_window_ms {
            config.rexmit_window_ms = window;
        }
        if self.name.is_some() {
            config.name = self.name;
        }
        if let Some(ratio) = self.fill_ratio {
            config.start_fill_ratio = ratio;
        }
        if self.max_lead.is_some() {
            config.max_lead = self.max_lead;
        }
        if let Some(stats) = self.stats {
            config.stats_interval_secs = stats;
        }

        config.validate()?;
        Ok(config)
    }
}

fn open_output(output: &str) -> anyhow::Result<Box<dyn Write + Send>> {
    if output == "-" {
        tracing::info!("Writing audio to stdout");
        Ok(Box::new(io::stdout()))
    } else {
        tracing::info!("Writing audio to {}", output);
        let file = File::create(output)
            .map_err(|e| anyhow::anyhow!("Failed to create output '{}': {}", output, e))?;
        Ok(Box::new(BufWriter::new(file)))
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let config = Args::parse().into_config()?;
    let options = config.to_options()?;

    let control = RadioSocket::bind_broadcast(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
    control.set_read_timeout(Some(POLL_TIMEOUT))?;
    let rexmit = RadioSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;

    let transports = ReceiverTransports {
        control: Arc::new(control),
        rexmit: Arc::new(rexmit),
        data: Arc::new(MulticastSocket::new(POLL_TIMEOUT)),
    };

    // The trigger lives until the process ends
    let (_trigger, shutdown) = shutdown_channel();
    let engine = ReceiverEngine::new(options, transports, shutdown.clone())?;
    let handle = engine.start(open_output(&config.output)?)?;

    if config.stats_interval_secs > 0 {
        let started = Instant::now();
        let mut timer = Timer::new(config.stats_interval());
        let stats = handle.stats();
        let navigator = handle.navigator();
        while !shutdown.wait_timeout(timer.time_until_expiration()) {
            if timer.try_fire() {
                tracing::info!(
                    "{}",
                    format_receiver_stats(
                        &stats.snapshot(),
                        navigator.active_name().as_deref(),
                        started.elapsed()
                    )
                );
            }
        }
    }

    handle.join();
    Ok(())
}
