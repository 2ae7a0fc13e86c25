//! Tracker module
//!
//! Peer discovery through HTTP trackers.

#[cfg(feature = "download")]
pub mod http;
pub mod response;

#[cfg(feature = "download")]
pub use http::{discover_peers, AnnounceRequest, HttpTracker};
pub use response::{parse_compact_peers, parse_tracker_response, TrackerResponse};
