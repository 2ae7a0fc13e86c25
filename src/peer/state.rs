//! Peer state module
//!
//! Defines per-connection peer information and statistics.

use std::net::SocketAddr;

use crate::protocol::ExtensionHandshake;

/// Highest piece index (exclusive) accepted from a `have` message
pub const MAX_HAVE_INDEX: usize = 1 << 20;

/// Lifecycle of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// Initial state, no connection
    #[default]
    Disconnected,
    /// TCP connected, handshake not yet confirmed
    Connecting,
    /// Handshake confirmed
    Connected,
}

impl PeerState {
    /// Check if the peer is connected
    pub fn is_connected(&self) -> bool {
        matches!(self, PeerState::Connected)
    }
}

/// Represents a remote peer with its state and statistics
#[derive(Debug, Clone)]
pub struct Peer {
    /// Peer address
    pub addr: SocketAddr,
    /// Peer identifier, confirmed by the handshake
    pub peer_id: Option<[u8; 20]>,
    /// Current state
    pub state: PeerState,
    /// We're interested
    pub am_interested: bool,
    /// They're choking us
    pub peer_choking: bool,
    /// Peer set the extension bit in its handshake
    pub supports_extensions: bool,
    /// Peer's extension handshake, once received
    pub extensions: Option<ExtensionHandshake>,
    /// Pieces they have (bitfield)
    pub bitfield: Option<Vec<u8>>,
    /// Verified pieces downloaded from this peer
    pub pieces_downloaded: u32,
    /// Block payload bytes received
    pub bytes_downloaded: u64,
    /// Pieces from this peer that failed verification
    pub failures: u32,
}

impl Peer {
    /// Create a new peer
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            peer_id: None,
            state: PeerState::Disconnected,
            am_interested: false,
            peer_choking: true,
            supports_extensions: false,
            extensions: None,
            bitfield: None,
            pieces_downloaded: 0,
            bytes_downloaded: 0,
            failures: 0,
        }
    }

    /// Update peer's bitfield
    pub fn update_bitfield(&mut self, bitfield: Vec<u8>) {
        self.bitfield = Some(bitfield);
    }

    /// Check if peer has specific piece
    pub fn has_piece(&self, piece_index: usize) -> bool {
        if let Some(ref bitfield) = self.bitfield {
            let byte_index = piece_index / 8;
            let bit_index = 7 - (piece_index % 8);

            if byte_index < bitfield.len() {
                return (bitfield[byte_index] >> bit_index) & 1 == 1;
            }
        }
        false
    }

    /// Record a `have` announcement.
    ///
    /// Indices at or past `MAX_HAVE_INDEX` are dropped so a peer cannot grow
    /// the bitfield without bound. Returns whether the piece was recorded.
    pub fn set_piece(&mut self, piece_index: usize) -> bool {
        if piece_index >= MAX_HAVE_INDEX {
            return false;
        }

        let byte_index = piece_index / 8;
        let bitfield = self.bitfield.get_or_insert_with(Vec::new);
        if bitfield.len() <= byte_index {
            bitfield.resize(byte_index + 1, 0);
        }
        bitfield[byte_index] |= 1 << (7 - (piece_index % 8));
        true
    }

    /// Get the number of pieces the peer has
    pub fn piece_count(&self) -> usize {
        self.bitfield
            .as_ref()
            .map_or(0, |bitfield| bitfield.iter().map(|byte| byte.count_ones() as usize).sum())
    }

    /// Check if we can request from peer
    pub fn can_request(&self) -> bool {
        !self.peer_choking && self.am_interested && self.state.is_connected()
    }

    /// The peer's `ut_metadata` sub-ID, if negotiated
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.extensions.as_ref().and_then(ExtensionHandshake::ut_metadata_id)
    }

    /// Get peer statistics
    pub fn stats(&self) -> PeerStats {
        PeerStats {
            addr: self.addr,
            peer_id: self.peer_id,
            pieces_downloaded: self.pieces_downloaded,
            bytes_downloaded: self.bytes_downloaded,
            failures: self.failures,
            advertised_pieces: self.piece_count(),
        }
    }
}

/// Peer statistics reported when a worker exits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStats {
    /// Peer address
    pub addr: SocketAddr,
    /// Peer identifier
    pub peer_id: Option<[u8; 20]>,
    /// Verified pieces downloaded from this peer
    pub pieces_downloaded: u32,
    /// Block payload bytes received
    pub bytes_downloaded: u64,
    /// Pieces that failed verification
    pub failures: u32,
    /// Pieces the peer claimed to have
    pub advertised_pieces: usize,
}

impl PeerStats {
    /// Get the peer ID as a hex string
    pub fn peer_id_hex(&self) -> Option<String> {
        self.peer_id.map(hex::encode)
    }
}
