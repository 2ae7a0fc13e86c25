//! Peer module
//!
//! Per-peer state and the connection that drives the wire protocol.

pub mod connection;
pub mod state;

// Re-export main types
pub use connection::PeerConnection;
pub use state::{Peer, PeerState, PeerStats};
