//! Extension protocol payloads
//!
//! The extension handshake that advertises `ut_metadata`, and the metadata
//! exchange messages used to fetch an info dictionary from a peer.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::{debug, trace};

use crate::bencode::{self, Dict, Value};
use crate::error::TorrentError;

/// Extended message sub-ID reserved for the extension handshake
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// Name of the metadata exchange extension
pub const UT_METADATA: &str = "ut_metadata";

/// The sub-ID we ask peers to use when sending us metadata messages
pub const LOCAL_UT_METADATA_ID: u8 = 1;

/// Metadata is exchanged in pieces of this size
pub const METADATA_PIECE_SIZE: usize = 16384;

/// Largest `metadata_size` a peer may announce
pub const MAX_METADATA_SIZE: usize = 8 * 1024 * 1024;

/// Contents of an extension handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionHandshake {
    /// Extension name to the sub-ID the sender wants to receive it on
    pub extensions: BTreeMap<String, u8>,
    /// Size of the info dictionary in bytes, when the sender knows it
    pub metadata_size: Option<usize>,
    /// Client name and version
    pub client: Option<String>,
}

impl ExtensionHandshake {
    /// Our handshake: `{"m": {"ut_metadata": 1}}`
    pub fn local() -> Self {
        let mut extensions = BTreeMap::new();
        extensions.insert(UT_METADATA.to_string(), LOCAL_UT_METADATA_ID);
        Self {
            extensions,
            metadata_size: None,
            client: None,
        }
    }

    /// The sub-ID the sender assigned to `ut_metadata`
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.extensions.get(UT_METADATA).copied().filter(|&id| id != 0)
    }

    /// Number of metadata pieces announced by `metadata_size`
    pub fn metadata_piece_count(&self) -> usize {
        match self.metadata_size {
            Some(size) if size > 0 => size.div_ceil(METADATA_PIECE_SIZE),
            _ => 1,
        }
    }

    /// Expected length of metadata piece `piece`, when the size is announced
    pub fn metadata_piece_len(&self, piece: usize) -> Option<usize> {
        self.metadata_size
            .map(|size| size.saturating_sub(piece * METADATA_PIECE_SIZE).min(METADATA_PIECE_SIZE))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut m = Dict::new();
        for (name, id) in &self.extensions {
            m.insert(name.as_bytes().to_vec(), Value::Int(i64::from(*id)));
        }

        let mut dict = Dict::new();
        dict.insert(b"m".to_vec(), Value::Dict(m));
        if let Some(size) = self.metadata_size {
            dict.insert(b"metadata_size".to_vec(), Value::Int(size as i64));
        }
        if let Some(client) = &self.client {
            dict.insert(b"v".to_vec(), Value::string(client));
        }
        bencode::encode(&Value::Dict(dict))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (value, _) = bencode::decode(payload, 0)?;
        let m = value.get(b"m").and_then(Value::as_dict).ok_or_else(|| {
            TorrentError::protocol_error("Extension handshake has no 'm' dictionary")
        })?;

        let mut extensions = BTreeMap::new();
        for (name, id) in m {
            match id.as_int().and_then(|id| u8::try_from(id).ok()) {
                Some(id) => {
                    extensions.insert(String::from_utf8_lossy(name).into_owned(), id);
                }
                None => debug!("Ignoring extension {:?} with id {:?}", String::from_utf8_lossy(name), id),
            }
        }

        let metadata_size = match value.get(b"metadata_size").and_then(Value::as_int) {
            Some(size) if (0..=MAX_METADATA_SIZE as i64).contains(&size) => Some(size as usize),
            Some(size) => {
                return Err(TorrentError::protocol_error(format!(
                    "metadata_size {} outside 0..={}",
                    size, MAX_METADATA_SIZE
                ))
                .into())
            }
            None => None,
        };

        let client = value.get(b"v").and_then(Value::as_str).map(str::to_string);
        trace!("Extension handshake: {:?}, metadata_size={:?}, client={:?}", extensions, metadata_size, client);

        Ok(Self {
            extensions,
            metadata_size,
            client,
        })
    }
}

/// A `ut_metadata` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: Option<usize>, data: Vec<u8> },
    Reject { piece: u32 },
}

impl MetadataMessage {
    /// Piece index this message refers to
    pub fn piece(&self) -> u32 {
        match self {
            MetadataMessage::Request { piece }
            | MetadataMessage::Data { piece, .. }
            | MetadataMessage::Reject { piece } => *piece,
        }
    }

    /// Header dictionary, followed by the raw piece bytes for data messages
    pub fn encode(&self) -> Vec<u8> {
        let (msg_type, extra) = match self {
            MetadataMessage::Request { .. } => (0, None),
            MetadataMessage::Data { total_size, .. } => (1, *total_size),
            MetadataMessage::Reject { .. } => (2, None),
        };

        let mut dict = Dict::new();
        dict.insert(b"msg_type".to_vec(), Value::Int(msg_type));
        dict.insert(b"piece".to_vec(), Value::Int(i64::from(self.piece())));
        if let Some(total_size) = extra {
            dict.insert(b"total_size".to_vec(), Value::Int(total_size as i64));
        }

        let mut out = bencode::encode(&Value::Dict(dict));
        if let MetadataMessage::Data { data, .. } = self {
            out.extend_from_slice(data);
        }
        out
    }

    /// Decode a payload; the header's encoded length marks where raw bytes begin
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (header, consumed) = bencode::decode(payload, 0)?;

        let msg_type = header.get(b"msg_type").and_then(Value::as_int).ok_or_else(|| {
            TorrentError::protocol_error("Metadata message has no msg_type")
        })?;
        let piece = header
            .get(b"piece")
            .and_then(Value::as_int)
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| TorrentError::protocol_error("Metadata message has no valid piece"))?;

        match msg_type {
            0 => Ok(MetadataMessage::Request { piece }),
            1 => {
                let total_size = header
                    .get(b"total_size")
                    .and_then(Value::as_int)
                    .and_then(|s| usize::try_from(s).ok());
                Ok(MetadataMessage::Data {
                    piece,
                    total_size,
                    data: payload[consumed..].to_vec(),
                })
            }
            2 => Ok(MetadataMessage::Reject { piece }),
            other => Err(TorrentError::protocol_error(format!("Unknown metadata msg_type {}", other)).into()),
        }
    }
}
