//! Torrent metadata module
//!
//! This module provides the typed metadata model plus ingestion of .torrent
//! files and magnet links.

pub mod info;
pub mod magnet;
pub mod parser;

pub use info::TorrentInfo;
pub use magnet::{MagnetInfo, MagnetParser};
pub use parser::TorrentParser;
