//! Statistics formatting
//!
//! Stats lines go through `tracing` (stderr); the receiver's stdout carries
//! the audio stream.

use radio::{ReceiverStatsSnapshot, SenderStatsSnapshot};
use std::time::Duration;

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format bandwidth in human-readable form
pub fn format_bandwidth(bps: u64) -> String {
    const KBPS: u64 = 1000;
    const MBPS: u64 = KBPS * 1000;

    if bps >= MBPS {
        format!("{:.2} Mbps", bps as f64 / MBPS as f64)
    } else if bps >= KBPS {
        format!("{:.2} Kbps", bps as f64 / KBPS as f64)
    } else {
        format!("{} bps", bps)
    }
}

/// Format duration in human-readable form
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn bitrate(bytes: u64, elapsed: Duration) -> u64 {
    match elapsed.as_secs() {
        0 => 0,
        secs => bytes * 8 / secs,
    }
}

/// One-line sender summary
pub fn format_sender_stats(
    stats: &SenderStatsSnapshot,
    payload_size: usize,
    elapsed: Duration,
) -> String {
    let bytes = stats.packets_sent * payload_size as u64;
    format!(
        "[{}] sent {} packets ({}, {}) | repairs {} of {} requested | lookups answered {}",
        format_duration(elapsed),
        stats.packets_sent,
        format_bytes(bytes),
        format_bandwidth(bitrate(bytes, elapsed)),
        stats.repairs_resent,
        stats.repair_ids_received,
        stats.lookups_answered
    )
}

/// One-line receiver summary
pub fn format_receiver_stats(
    stats: &ReceiverStatsSnapshot,
    station: Option<&str>,
    elapsed: Duration,
) -> String {
    format!(
        "[{}] station {} | datagrams {} | played {} | sessions {} | gaps {} | repair requests {} | desyncs {}",
        format_duration(elapsed),
        station.unwrap_or("-"),
        stats.datagrams_received,
        stats.frames_played,
        stats.sessions_started,
        stats.gaps_detected,
        stats.repair_requests_sent,
        stats.desyncs
    )
}
