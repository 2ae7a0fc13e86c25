//! bt-fetch
//!
//! A BitTorrent client library: bencode codec, torrent metadata, the peer
//! wire protocol with metadata exchange, and a concurrent piece downloader.

pub mod bencode;
pub mod cli;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod storage;
pub mod torrent;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{DecodeErrorKind, TorrentError};

pub use bencode::Value;
pub use cli::{CliArgs, Command, Config, ProgressDisplay};
pub use peer::{Peer, PeerConnection, PeerState, PeerStats};
pub use protocol::{ExtensionHandshake, Handshake, Message, MessageId, MetadataMessage};
pub use storage::{AssembledOutput, DownloadManager, DownloadStats, PieceTask, WorkQueue};
pub use torrent::{MagnetInfo, MagnetParser, TorrentInfo, TorrentParser};
#[cfg(feature = "download")]
pub use tracker::discover_peers;
pub use tracker::TrackerResponse;
