//! Error types for the torrent client
//!
//! This module defines the error taxonomy shared by the codec, the metadata
//! model, the peer transport and the piece scheduler.

use std::fmt;

/// The specific way a bencoded document failed to decode (or encode)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// String length prefix is missing, non-numeric or unterminated
    MalformedLength,
    /// Fewer bytes remain than the structure requires
    TruncatedInput,
    /// Integer is unterminated, empty, non-canonical or out of range
    MalformedInteger,
    /// A dictionary key decoded to something other than a byte string
    NonStringKey,
    /// Byte that cannot start a value
    UnexpectedToken,
    /// Bytes left over after a complete top-level value
    TrailingData,
    /// A value outside the four encodable variants
    UnsupportedValue,
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DecodeErrorKind::MalformedLength => "malformed length",
            DecodeErrorKind::TruncatedInput => "truncated input",
            DecodeErrorKind::MalformedInteger => "malformed integer",
            DecodeErrorKind::NonStringKey => "non-string key",
            DecodeErrorKind::UnexpectedToken => "unexpected token",
            DecodeErrorKind::TrailingData => "trailing data",
            DecodeErrorKind::UnsupportedValue => "unsupported value",
        };
        f.write_str(name)
    }
}

/// Comprehensive error type for torrent operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Codec-level decode/encode failures
    MalformedEncoding {
        message: String,
        kind: DecodeErrorKind,
        position: Option<usize>,
    },

    /// Missing required keys or inconsistent torrent metadata
    MetadataInvalid {
        message: String,
        field: Option<String>,
    },

    /// Connect/read/write failures and short reads
    TransportError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// A peer sent something the protocol does not allow at this point
    ProtocolViolation {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Digest mismatch after reassembly
    IntegrityFailure {
        message: String,
        piece: Option<u32>,
    },

    /// Tracker HTTP or response decoding failure
    DiscoveryError {
        message: String,
        tracker: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },
}

impl TorrentError {
    /// Create a new MalformedEncoding error
    pub fn encoding_error(message: impl Into<String>, kind: DecodeErrorKind) -> Self {
        TorrentError::MalformedEncoding {
            message: message.into(),
            kind,
            position: None,
        }
    }

    /// Create a new MalformedEncoding error at a byte offset
    pub fn encoding_error_at(message: impl Into<String>, kind: DecodeErrorKind, position: usize) -> Self {
        TorrentError::MalformedEncoding {
            message: message.into(),
            kind,
            position: Some(position),
        }
    }

    /// Create a new MetadataInvalid error
    pub fn metadata_error(message: impl Into<String>) -> Self {
        TorrentError::MetadataInvalid {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new MetadataInvalid error naming the offending field
    pub fn metadata_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::MetadataInvalid {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new TransportError
    pub fn transport_error(message: impl Into<String>) -> Self {
        TorrentError::TransportError {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new TransportError with peer and source
    pub fn transport_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::TransportError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolViolation
    pub fn protocol_error(message: impl Into<String>) -> Self {
        TorrentError::ProtocolViolation {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new ProtocolViolation with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ProtocolViolation {
            message: message.into(),
            peer: None,
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolViolation with peer and source
    pub fn protocol_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ProtocolViolation {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new IntegrityFailure
    pub fn integrity_error(message: impl Into<String>) -> Self {
        TorrentError::IntegrityFailure {
            message: message.into(),
            piece: None,
        }
    }

    /// Create a new IntegrityFailure for a piece index
    pub fn integrity_error_for_piece(message: impl Into<String>, piece: u32) -> Self {
        TorrentError::IntegrityFailure {
            message: message.into(),
            piece: Some(piece),
        }
    }

    /// Create a new DiscoveryError
    pub fn discovery_error(message: impl Into<String>) -> Self {
        TorrentError::DiscoveryError {
            message: message.into(),
            tracker: None,
            source: None,
        }
    }

    /// Create a new DiscoveryError with tracker and source
    pub fn discovery_error_full(message: impl Into<String>, tracker: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::DiscoveryError {
            message: message.into(),
            tracker: Some(tracker.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// The decode failure kind, if this is a codec error
    pub fn decode_kind(&self) -> Option<DecodeErrorKind> {
        match self {
            TorrentError::MalformedEncoding { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether the failure came from the network rather than from the data
    pub fn is_transport(&self) -> bool {
        matches!(self, TorrentError::TransportError { .. })
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            TorrentError::TransportError { source, .. }
            | TorrentError::ProtocolViolation { source, .. }
            | TorrentError::DiscoveryError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            TorrentError::MalformedEncoding { message, .. }
            | TorrentError::MetadataInvalid { message, .. }
            | TorrentError::IntegrityFailure { message, .. }
            | TorrentError::ConfigError { message, .. } => {
                *message = format!("{} ({})", message, ctx);
            }
        }
        self
    }

    /// Attach the remote address to peer-facing errors that lack one
    pub fn with_peer(mut self, addr: impl Into<String>) -> Self {
        if let TorrentError::TransportError { peer, .. } | TorrentError::ProtocolViolation { peer, .. } = &mut self {
            if peer.is_none() {
                *peer = Some(addr.into());
            }
        }
        self
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::MalformedEncoding { message, kind, position } => {
                if let Some(pos) = position {
                    write!(f, "Malformed encoding: {} [{}] at byte {}", message, kind, pos)
                } else {
                    write!(f, "Malformed encoding: {} [{}]", message, kind)
                }
            }
            TorrentError::MetadataInvalid { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Invalid metadata: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Invalid metadata: {}", message)
                }
            }
            TorrentError::TransportError { message, peer, source } => {
                match (peer, source) {
                    (Some(p), Some(s)) => write!(f, "Transport error: {} (peer: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Transport error: {} (peer: {})", message, p),
                    (None, Some(s)) => write!(f, "Transport error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Transport error: {}", message),
                }
            }
            TorrentError::ProtocolViolation { message, peer, source } => {
                match (peer, source) {
                    (Some(p), Some(s)) => write!(f, "Protocol violation: {} (peer: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Protocol violation: {} (peer: {})", message, p),
                    (None, Some(s)) => write!(f, "Protocol violation: {} (source: {})", message, s),
                    (None, None) => write!(f, "Protocol violation: {}", message),
                }
            }
            TorrentError::IntegrityFailure { message, piece } => {
                if let Some(index) = piece {
                    write!(f, "Integrity failure: {} (piece: {})", message, index)
                } else {
                    write!(f, "Integrity failure: {}", message)
                }
            }
            TorrentError::DiscoveryError { message, tracker, source } => {
                match (tracker, source) {
                    (Some(t), Some(s)) => write!(f, "Discovery error: {} (tracker: {}, source: {})", message, t, s),
                    (Some(t), None) => write!(f, "Discovery error: {} (tracker: {})", message, t),
                    (None, Some(s)) => write!(f, "Discovery error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Discovery error: {}", message),
                }
            }
            TorrentError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for TorrentError {}

// Implement From traits for common error types

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::TransportError {
            message: err.to_string(),
            peer: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::encoding_error(format!("Failed to parse JSON data: {}", err), DecodeErrorKind::UnexpectedToken)
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::ConfigError {
            message: format!("Failed to parse address: {}", err),
            field: None,
        }
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        TorrentError::transport_error("Operation timed out")
    }
}

#[cfg(feature = "download")]
impl From<reqwest::Error> for TorrentError {
    fn from(err: reqwest::Error) -> Self {
        let tracker = err.url().map(|u| u.to_string()).unwrap_or_else(|| "unknown".to_string());
        TorrentError::discovery_error_full("Tracker request failed", tracker, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_error_display() {
        let err = TorrentError::encoding_error_at("string runs past end", DecodeErrorKind::TruncatedInput, 7);
        let text = err.to_string();
        assert!(text.contains("Malformed encoding"));
        assert!(text.contains("truncated input"));
        assert!(text.contains("byte 7"));
        assert_eq!(err.decode_kind(), Some(DecodeErrorKind::TruncatedInput));
    }

    #[test]
    fn test_metadata_error_with_field() {
        let err = TorrentError::metadata_error_with_field("Missing key", "piece length");
        assert!(err.to_string().contains("Invalid metadata"));
        assert!(err.to_string().contains("piece length"));
        assert_eq!(err.decode_kind(), None);
    }

    #[test]
    fn test_transport_error_full() {
        let err = TorrentError::transport_error_full("Connection reset", "127.0.0.1:6881", "eof");
        assert!(err.is_transport());
        assert!(err.to_string().contains("127.0.0.1:6881"));
        assert!(err.to_string().contains("eof"));
    }

    #[test]
    fn test_integrity_error_for_piece() {
        let err = TorrentError::integrity_error_for_piece("hash mismatch", 3);
        assert!(!err.is_transport());
        assert_eq!(err.to_string(), "Integrity failure: hash mismatch (piece: 3)");
    }

    #[test]
    fn test_with_context() {
        let err = TorrentError::protocol_error("Unexpected message").with_context("while waiting for unchoke");
        assert!(err.to_string().contains("while waiting for unchoke"));

        let err = TorrentError::metadata_error("Missing info").with_context("magnet");
        assert!(err.to_string().contains("(magnet)"));
    }

    #[test]
    fn test_with_peer_keeps_existing_address() {
        let err = TorrentError::protocol_error("Bad bitfield").with_peer("10.0.0.1:6881");
        assert!(err.to_string().contains("peer: 10.0.0.1:6881"));

        let err = TorrentError::transport_error_full("reset", "10.0.0.2:1", "eof").with_peer("10.0.0.3:1");
        assert!(err.to_string().contains("10.0.0.2:1"));

        let err = TorrentError::integrity_error("mismatch").with_peer("10.0.0.1:6881");
        assert_eq!(err.to_string(), "Integrity failure: mismatch");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "early eof");
        let err: TorrentError = io_err.into();
        assert!(matches!(err, TorrentError::TransportError { .. }));
    }

    #[test]
    fn test_from_addr_parse_error() {
        let addr_err = "invalid:address".parse::<std::net::SocketAddr>().unwrap_err();
        let err: TorrentError = addr_err.into();
        assert!(matches!(err, TorrentError::ConfigError { .. }));
    }

    #[test]
    fn test_config_error_with_field() {
        let err = TorrentError::config_error_with_field("Invalid value", "block_size");
        assert!(err.to_string().contains("Config error"));
        assert!(err.to_string().contains("block_size"));
    }
}
