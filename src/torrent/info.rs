//! Torrent information structures
//!
//! Typed, read-only view over a decoded info dictionary.

use anyhow::Result;
use sha1::{Digest, Sha1};
use tracing::{debug, trace};

use crate::bencode::{self, Value};
use crate::error::TorrentError;

/// Length of a SHA-1 digest
pub const HASH_LEN: usize = 20;

/// High-level torrent information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    /// Tracker announce URL
    pub announce: String,
    /// SHA1 hash of the canonical encoding of the info dictionary
    pub info_hash: [u8; 20],
    /// Size of each piece in bytes
    pub piece_length: u64,
    /// Total payload size in bytes
    pub length: u64,
    /// Suggested file name
    pub name: String,
    /// Expected SHA1 hash of every piece, in index order
    pub pieces: Vec<[u8; 20]>,
}

impl TorrentInfo {
    /// Build the metadata view from a decoded info dictionary.
    ///
    /// The info hash is computed over the canonical re-encoding of `info`,
    /// so the result does not depend on key order in the source bytes.
    pub fn from_info_dict(announce: impl Into<String>, info: &Value) -> Result<Self> {
        let dict = info.as_dict().ok_or_else(|| {
            TorrentError::metadata_error_with_field(
                format!("info must be a dictionary, got {}", info.type_name()),
                "info",
            )
        })?;

        if dict.contains_key(b"files".as_slice()) && !dict.contains_key(b"length".as_slice()) {
            return Err(TorrentError::metadata_error_with_field(
                "Multi-file torrents are not supported",
                "files",
            )
            .into());
        }

        let piece_length = positive_int(info, "piece length")?;
        let length = positive_int(info, "length")?;

        let pieces_bytes = info.get(b"pieces").and_then(Value::as_bytes).ok_or_else(|| {
            TorrentError::metadata_error_with_field("Missing or non-string pieces", "pieces")
        })?;
        let pieces = Self::parse_piece_hashes(pieces_bytes)?;

        let expected = length.div_ceil(piece_length);
        if pieces.len() as u64 != expected {
            return Err(TorrentError::metadata_error_with_field(
                format!(
                    "Expected {} piece hashes for {} bytes at {} bytes per piece, found {}",
                    expected,
                    length,
                    piece_length,
                    pieces.len()
                ),
                "pieces",
            )
            .into());
        }

        let info_hash = Self::generate_info_hash(&bencode::encode(info));
        let name = match info.get(b"name").and_then(Value::as_bytes) {
            Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            None => {
                debug!("Info dictionary has no name, falling back to info hash");
                hex::encode(info_hash)
            }
        };

        trace!(
            "Info dictionary: name={}, length={}, piece_length={}, pieces={}",
            name,
            length,
            piece_length,
            pieces.len()
        );

        Ok(TorrentInfo {
            announce: announce.into(),
            info_hash,
            piece_length,
            length,
            name,
            pieces,
        })
    }

    /// Build the metadata view from raw info dictionary bytes fetched from a peer
    pub fn from_metadata(announce: impl Into<String>, metadata: &[u8]) -> Result<Self> {
        let info = bencode::decode_all(metadata)?;
        Self::from_info_dict(announce, &info)
    }

    /// Get number of pieces in torrent
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Size of a piece in bytes; the last piece holds the remainder
    pub fn piece_size(&self, index: usize) -> Option<u64> {
        if index >= self.pieces.len() {
            return None;
        }
        if index + 1 < self.pieces.len() {
            return Some(self.piece_length);
        }
        match self.length % self.piece_length {
            0 => Some(self.piece_length),
            rem => Some(rem),
        }
    }

    /// Get piece hash for a specific piece index
    pub fn piece_hash(&self, index: usize) -> Option<[u8; 20]> {
        self.pieces.get(index).copied()
    }

    /// Get info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Piece hashes as hex strings, in index order
    pub fn piece_hashes_hex(&self) -> Vec<String> {
        self.pieces.iter().map(hex::encode).collect()
    }

    /// Generate info hash from info dictionary bytes
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Parse piece hashes from concatenated bytes in torrent file
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % HASH_LEN != 0 {
            return Err(TorrentError::metadata_error_with_field(
                format!(
                    "Pieces field length must be a multiple of 20, got {}",
                    pieces_bytes.len()
                ),
                "pieces",
            )
            .into());
        }

        let mut pieces = Vec::with_capacity(pieces_bytes.len() / HASH_LEN);
        for chunk in pieces_bytes.chunks_exact(HASH_LEN) {
            let mut hash = [0u8; HASH_LEN];
            hash.copy_from_slice(chunk);
            pieces.push(hash);
        }

        Ok(pieces)
    }
}

fn positive_int(info: &Value, key: &str) -> Result<u64> {
    let value = info
        .get(key.as_bytes())
        .and_then(Value::as_int)
        .ok_or_else(|| TorrentError::metadata_error_with_field(format!("Missing or non-integer {}", key), key))?;

    if value <= 0 {
        return Err(TorrentError::metadata_error_with_field(
            format!("{} must be positive, got {}", key, value),
            key,
        )
        .into());
    }
    Ok(value as u64)
}

/// Build a single-file info dictionary describing `content`
#[cfg(test)]
pub(crate) fn info_dict_for(name: &str, piece_length: usize, content: &[u8]) -> Value {
    use crate::bencode::Dict;

    let pieces: Vec<u8> = content
        .chunks(piece_length)
        .flat_map(|chunk| TorrentInfo::generate_info_hash(chunk))
        .collect();

    let mut dict = Dict::new();
    dict.insert(b"name".to_vec(), Value::string(name));
    dict.insert(b"piece length".to_vec(), Value::Int(piece_length as i64));
    dict.insert(b"length".to_vec(), Value::Int(content.len() as i64));
    dict.insert(b"pieces".to_vec(), Value::Bytes(pieces));
    Value::Dict(dict)
}
