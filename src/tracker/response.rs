//! Tracker response decoding
//!
//! Announce responses carry peers either as a compact byte string (6 bytes
//! per IPv4 peer) or as a list of `{ip, port}` dictionaries.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Result;
use tracing::{debug, warn};

use crate::bencode::{self, Value};
use crate::error::TorrentError;

/// Bytes per peer in the compact IPv4 format
pub const COMPACT_PEER_LEN: usize = 6;

/// Decoded announce response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerResponse {
    /// Seconds the tracker wants between announces
    pub interval: Option<u64>,
    pub peers: Vec<SocketAddr>,
    pub warning: Option<String>,
}

/// Decode an announce response body
pub fn parse_tracker_response(body: &[u8]) -> Result<TrackerResponse> {
    let value = bencode::decode_all(body).map_err(|e| {
        TorrentError::discovery_error_full("Tracker response is not valid bencode", "response", e.to_string())
    })?;

    if value.as_dict().is_none() {
        return Err(TorrentError::discovery_error(format!(
            "Tracker response must be a dictionary, got {}",
            value.type_name()
        ))
        .into());
    }

    if let Some(reason) = value.get(b"failure reason") {
        let reason = reason.as_bytes().map(String::from_utf8_lossy).unwrap_or_default();
        return Err(TorrentError::discovery_error(format!("Tracker refused announce: {}", reason)).into());
    }

    let warning = value.get(b"warning message").and_then(Value::as_str).map(str::to_string);
    if let Some(warning) = &warning {
        warn!("Tracker warning: {}", warning);
    }

    let interval = value
        .get(b"interval")
        .and_then(Value::as_int)
        .and_then(|i| u64::try_from(i).ok());

    let peers = match value.get(b"peers") {
        Some(Value::Bytes(bytes)) => parse_compact_peers(bytes)?,
        Some(Value::List(list)) => parse_peer_dicts(list),
        Some(other) => {
            return Err(TorrentError::discovery_error(format!(
                "Unexpected peers field of type {}",
                other.type_name()
            ))
            .into())
        }
        None => return Err(TorrentError::discovery_error("Tracker response has no peers").into()),
    };

    debug!("Tracker returned {} peers (interval {:?})", peers.len(), interval);
    Ok(TrackerResponse {
        interval,
        peers,
        warning,
    })
}

/// Split a compact peer string into addresses
pub fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddr>> {
    if bytes.len() % COMPACT_PEER_LEN != 0 {
        return Err(TorrentError::discovery_error(format!(
            "Compact peer list length {} is not a multiple of {}",
            bytes.len(),
            COMPACT_PEER_LEN
        ))
        .into());
    }

    Ok(bytes
        .chunks_exact(COMPACT_PEER_LEN)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect())
}

fn parse_peer_dicts(list: &[Value]) -> Vec<SocketAddr> {
    list.iter()
        .filter_map(|peer| {
            let ip = peer.get(b"ip").and_then(Value::as_str)?.parse::<IpAddr>().ok();
            let port = peer.get(b"port").and_then(Value::as_int).and_then(|p| u16::try_from(p).ok());
            match (ip, port) {
                (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
                _ => {
                    debug!("Skipping malformed peer entry {:?}", peer);
                    None
                }
            }
        })
        .collect()
}
