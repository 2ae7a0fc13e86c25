//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// CLI arguments for the torrent client
#[derive(Debug, Parser)]
#[command(name = "bt-fetch")]
#[command(about = "A BitTorrent client with pipelined piece downloads and magnet-link support", long_about = None)]
pub struct CliArgs {
    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Port advertised to the tracker
    #[arg(long, global = true, default_value_t = 6881)]
    pub port: u16,

    /// Maximum number of peer connections
    #[arg(long, global = true, default_value_t = 50)]
    pub max_connections: usize,

    /// Block request size in bytes
    #[arg(long, global = true, default_value_t = 16384)]
    pub block_size: u32,

    /// Seconds to wait when dialing a peer
    #[arg(long, global = true, default_value_t = 10)]
    pub connect_timeout: u64,

    /// Seconds to wait for any single read from a peer
    #[arg(long, global = true, default_value_t = 30)]
    pub read_timeout: u64,

    /// Corrupt pieces a peer may serve before it is dropped
    #[arg(long, global = true, default_value_t = 3)]
    pub max_peer_failures: u32,

    /// Overall download deadline in seconds
    #[arg(long = "timeout", global = true, value_name = "SECS")]
    pub download_timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Decode a bencoded value and print it as JSON
    #[command(name = "decode")]
    Decode {
        /// Bencoded input, e.g. d3:foo3:bare
        value: String,
    },

    /// Encode a JSON document as bencode
    #[command(name = "encode")]
    Encode {
        /// JSON input, e.g. {"foo":"bar"}
        json: String,
    },

    /// Print a torrent file's metadata
    #[command(name = "info")]
    Info {
        #[arg(value_name = "TORRENT_FILE")]
        torrent: PathBuf,
    },

    /// List the peers the tracker returns for a torrent
    #[command(name = "peers")]
    Peers {
        #[arg(value_name = "TORRENT_FILE")]
        torrent: PathBuf,
    },

    /// Handshake with a single peer and print its peer id
    #[command(name = "handshake")]
    Handshake {
        #[arg(value_name = "TORRENT_FILE")]
        torrent: PathBuf,
        /// Peer address as ip:port
        peer: String,
    },

    /// Download and verify one piece
    #[command(name = "download_piece")]
    DownloadPiece {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
        #[arg(value_name = "TORRENT_FILE")]
        torrent: PathBuf,
        /// Zero-based piece index
        index: u32,
    },

    /// Download the whole file
    #[command(name = "download")]
    Download {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
        #[arg(value_name = "TORRENT_FILE")]
        torrent: PathBuf,
    },

    /// Print the tracker and info hash of a magnet link
    #[command(name = "magnet_parse")]
    MagnetParse {
        #[arg(value_name = "MAGNET_LINK")]
        magnet: String,
    },

    /// Extension handshake with the first peer of a magnet link
    #[command(name = "magnet_handshake")]
    MagnetHandshake {
        #[arg(value_name = "MAGNET_LINK")]
        magnet: String,
    },

    /// Fetch metadata for a magnet link and print it
    #[command(name = "magnet_info")]
    MagnetInfo {
        #[arg(value_name = "MAGNET_LINK")]
        magnet: String,
    },

    /// Fetch metadata for a magnet link, then download one piece
    #[command(name = "magnet_download_piece")]
    MagnetDownloadPiece {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
        #[arg(value_name = "MAGNET_LINK")]
        magnet: String,
        /// Zero-based piece index
        index: u32,
    },

    /// Fetch metadata for a magnet link, then download the whole file
    #[command(name = "magnet_download")]
    MagnetDownload {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
        #[arg(value_name = "MAGNET_LINK")]
        magnet: String,
    },
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let args = CliArgs::try_parse_from(["bt-fetch", "info", "sample.torrent"]).unwrap();

        assert_eq!(args.port, 6881);
        assert_eq!(args.max_connections, 50);
        assert_eq!(args.block_size, 16384);
        assert_eq!(args.connect_timeout, 10);
        assert_eq!(args.read_timeout, 30);
        assert_eq!(args.max_peer_failures, 3);
        assert_eq!(args.download_timeout, None);
        assert_eq!(args.log_level(), tracing::Level::INFO);
        assert!(matches!(args.command, Command::Info { .. }));
    }

    #[test]
    fn test_snake_case_subcommands() {
        let args = CliArgs::try_parse_from([
            "bt-fetch",
            "download_piece",
            "-o",
            "/tmp/piece-0",
            "sample.torrent",
            "0",
        ])
        .unwrap();

        match args.command {
            Command::DownloadPiece { output, torrent, index } => {
                assert_eq!(output, PathBuf::from("/tmp/piece-0"));
                assert_eq!(torrent, PathBuf::from("sample.torrent"));
                assert_eq!(index, 0);
            }
            other => panic!("unexpected command {:?}", other),
        }

        let args = CliArgs::try_parse_from(["bt-fetch", "magnet_parse", "magnet:?xt=urn:btih:00"]).unwrap();
        assert!(matches!(args.command, Command::MagnetParse { .. }));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = CliArgs::try_parse_from([
            "bt-fetch",
            "download",
            "-o",
            "out.bin",
            "sample.torrent",
            "--timeout",
            "120",
            "-v",
        ])
        .unwrap();

        assert_eq!(args.download_timeout, Some(120));
        assert_eq!(args.log_level(), tracing::Level::DEBUG);
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(CliArgs::try_parse_from(["bt-fetch", "-v", "-q", "decode", "i1e"]).is_err());
    }
}
