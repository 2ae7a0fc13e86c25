//! Progress display module
//!
//! Draws a single, self-overwriting progress line on stderr so that
//! command output on stdout stays clean.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::storage::DownloadStats;

const BAR_WIDTH: usize = 40;

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed to human readable string
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Format duration to human readable string
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Calculate ETA based on download speed and remaining bytes
pub fn calculate_eta(downloaded: u64, total: u64, speed: f64) -> Option<Duration> {
    if speed <= 0.0 || downloaded >= total {
        return None;
    }

    let remaining = total.saturating_sub(downloaded) as f64;
    Some(Duration::from_secs_f64(remaining / speed))
}

/// Progress display for CLI
pub struct ProgressDisplay {
    last_update: Option<Instant>,
    update_interval: Duration,
    quiet: bool,
}

impl ProgressDisplay {
    pub fn new(quiet: bool) -> Self {
        Self::with_interval(quiet, Duration::from_millis(250))
    }

    pub fn with_interval(quiet: bool, interval: Duration) -> Self {
        Self {
            last_update: None,
            update_interval: interval,
            quiet,
        }
    }

    /// Redraw the progress line, throttled except for the final update
    pub fn update(&mut self, stats: &DownloadStats) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        let due = self.last_update.map_or(true, |at| at.elapsed() >= self.update_interval);
        if !due && !stats.is_complete() {
            return Ok(());
        }
        self.last_update = Some(Instant::now());

        let mut stderr = io::stderr().lock();
        write!(stderr, "\r\x1b[2K{}", Self::render_line(stats))?;
        stderr.flush()
    }

    /// The progress line for the given statistics
    pub fn render_line(stats: &DownloadStats) -> String {
        let percent = stats.progress() * 100.0;
        let filled = ((stats.progress() * BAR_WIDTH as f64) as usize).min(BAR_WIDTH);
        let bar = "=".repeat(filled) + &" ".repeat(BAR_WIDTH - filled);

        let eta = calculate_eta(stats.bytes_done, stats.bytes_total, stats.speed())
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());

        format!(
            "[{}] {:.1}% | {}/{} pieces | {} / {} | {} | Peers: {} | ETA: {}",
            bar,
            percent,
            stats.pieces_done,
            stats.pieces_total,
            format_bytes(stats.bytes_done),
            format_bytes(stats.bytes_total),
            format_speed(stats.speed()),
            stats.peers,
            eta,
        )
    }

    /// End the progress line and print a summary
    pub fn finish(&self, stats: &DownloadStats) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        let mut stderr = io::stderr().lock();
        writeln!(stderr)?;
        writeln!(
            stderr,
            "Downloaded {} in {} ({})",
            format_bytes(stats.bytes_done),
            format_duration(stats.elapsed()),
            format_speed(stats.speed())
        )
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}
