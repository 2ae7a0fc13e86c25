//! Torrent file parser
//!
//! Handles parsing of .torrent files and extracting metadata.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, trace};

use crate::bencode::{self, Value};
use crate::error::TorrentError;
use crate::torrent::info::TorrentInfo;

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        info!("Parsing torrent file from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let root = bencode::decode_all(data)?;
        if root.as_dict().is_none() {
            return Err(TorrentError::metadata_error(format!(
                "Torrent root must be a dictionary, got {}",
                root.type_name()
            ))
            .into());
        }

        let announce = root
            .get(b"announce")
            .and_then(Value::as_str)
            .ok_or_else(|| TorrentError::metadata_error_with_field("Missing announce URL", "announce"))?;

        let info_dict = root
            .get(b"info")
            .ok_or_else(|| TorrentError::metadata_error_with_field("Missing info dictionary", "info"))?;

        let torrent = TorrentInfo::from_info_dict(announce, info_dict)?;
        info!(
            "Parsed torrent '{}': {} bytes in {} pieces, info hash {}",
            torrent.name,
            torrent.length,
            torrent.piece_count(),
            torrent.info_hash_hex()
        );
        Ok(torrent)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &Path) -> Result<TorrentInfo> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read torrent file '{}'", path.display()))?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data)
    }
}
