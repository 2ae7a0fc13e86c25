//! CLI configuration module
//!
//! Runtime settings passed explicitly to the transport and the scheduler.

use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use crate::cli::args::CliArgs;
use crate::error::TorrentError;
use crate::protocol::Handshake;

/// Largest block a peer is expected to serve
pub const MAX_BLOCK_SIZE: u32 = 16384;

/// Configuration for the torrent client
#[derive(Debug, Clone)]
pub struct Config {
    /// Our 20-byte peer identifier
    pub peer_id: [u8; 20],
    /// Port advertised to the tracker
    pub port: u16,
    /// Request size for piece blocks
    pub block_size: u32,
    /// Maximum number of peer connections
    pub max_connections: usize,
    /// Bound on dialing a peer
    pub connect_timeout: Duration,
    /// Bound on every handshake and message read
    pub read_timeout: Duration,
    /// Integrity failures after which a worker retires itself
    pub max_peer_failures: u32,
    /// Optional deadline for a whole download
    pub download_timeout: Option<Duration>,
    /// Verbose output
    pub verbose: bool,
    /// Quiet mode
    pub quiet: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_id: Handshake::generate_peer_id(),
            port: 6881,
            block_size: MAX_BLOCK_SIZE,
            max_connections: 50,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            max_peer_failures: 3,
            download_timeout: None,
            verbose: false,
            quiet: false,
        }
    }
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let config = Self {
            port: args.port,
            block_size: args.block_size,
            max_connections: args.max_connections,
            connect_timeout: Duration::from_secs(args.connect_timeout),
            read_timeout: Duration::from_secs(args.read_timeout),
            max_peer_failures: args.max_peer_failures,
            download_timeout: args.download_timeout.map(Duration::from_secs),
            verbose: args.verbose,
            quiet: args.quiet,
            ..Self::default()
        };

        config.validate()?;
        debug!("Using configuration: {:?}", config);
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(TorrentError::config_error_with_field("Port cannot be 0", "port").into());
        }

        if self.max_connections == 0 {
            return Err(TorrentError::config_error_with_field(
                "max_connections must be at least 1",
                "max_connections",
            )
            .into());
        }

        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(TorrentError::config_error_with_field(
                format!("block_size must be between 1 and {}, got {}", MAX_BLOCK_SIZE, self.block_size),
                "block_size",
            )
            .into());
        }

        if self.max_peer_failures == 0 {
            return Err(TorrentError::config_error_with_field(
                "max_peer_failures must be at least 1",
                "max_peer_failures",
            )
            .into());
        }

        if self.connect_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err(TorrentError::config_error_with_field("Timeouts must be non-zero", "timeout").into());
        }

        Ok(())
    }

    /// Peer id as printable hex
    pub fn peer_id_hex(&self) -> String {
        hex::encode(self.peer_id)
    }
}
