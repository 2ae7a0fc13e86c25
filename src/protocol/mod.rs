//! BitTorrent protocol module
//!
//! Implements the BitTorrent peer wire protocol and the extension protocol
//! used for metadata exchange.

pub mod extension;
pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use extension::{ExtensionHandshake, MetadataMessage};
pub use handshake::{Handshake, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{BitTorrentWire, WireProtocol};
