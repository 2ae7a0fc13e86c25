//! Magnet link parser
//!
//! Handles parsing of magnet: URIs to extract the info hash and trackers.

use anyhow::Result;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::TorrentError;

/// Parsed magnet link information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetInfo {
    /// SHA1 info hash from the magnet link
    pub info_hash: [u8; 20],
    /// Display name (dn parameter)
    pub display_name: Option<String>,
    /// Tracker URLs (tr parameters), in link order
    pub trackers: Vec<String>,
    /// Total file size in bytes (xl parameter)
    pub total_size: Option<u64>,
}

impl MagnetInfo {
    /// The tracker used for announces: the first `tr` parameter
    pub fn announce(&self) -> Option<&str> {
        self.trackers.first().map(String::as_str)
    }

    /// Get info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

/// Parser for magnet links
pub struct MagnetParser;

impl MagnetParser {
    /// Parse a magnet link string
    ///
    /// # Example
    /// ```ignore
    /// let magnet = "magnet:?xt=urn:btih:ad42ce8109f54c99613ce38f9b4d87e70f24a165&dn=magnet1.gif";
    /// let info = MagnetParser::parse(magnet)?;
    /// ```
    pub fn parse(magnet_uri: &str) -> Result<MagnetInfo> {
        info!("Parsing magnet link: {}", magnet_uri);

        let url = Url::parse(magnet_uri.trim()).map_err(|e| {
            warn!("Invalid magnet URL format: {}", e);
            TorrentError::metadata_error(format!("Invalid magnet URL format: {}", e))
        })?;

        if url.scheme() != "magnet" {
            warn!("URL is not a magnet link: scheme is '{}'", url.scheme());
            return Err(TorrentError::metadata_error(format!(
                "URL is not a magnet link (scheme '{}')",
                url.scheme()
            ))
            .into());
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut total_size = None;

        for (key, value) in url.query_pairs() {
            debug!("Processing parameter: {} = {}", key, value);

            match &*key {
                "xt" => {
                    if let Some(hash) = Self::extract_info_hash(&value)? {
                        info_hash = Some(hash);
                    }
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                "xl" => match value.parse::<u64>() {
                    Ok(size) => total_size = Some(size),
                    Err(_) => warn!("Invalid xl parameter value: {}", value),
                },
                _ => debug!("Ignoring unknown parameter: {}", key),
            }
        }

        let info_hash = info_hash.ok_or_else(|| {
            warn!("Magnet link missing required info hash (xt parameter)");
            TorrentError::metadata_error_with_field(
                "Magnet link must contain an info hash (xt=urn:btih:<hash>)",
                "xt",
            )
        })?;

        info!(
            "Parsed magnet link: info_hash={}, name={}, trackers={}",
            hex::encode(info_hash),
            display_name.as_deref().unwrap_or("(none)"),
            trackers.len()
        );

        Ok(MagnetInfo {
            info_hash,
            display_name,
            trackers,
            total_size,
        })
    }

    /// Extract info hash from an xt parameter value of the form `urn:btih:<40 hex>`
    fn extract_info_hash(xt_value: &str) -> Result<Option<[u8; 20]>> {
        let Some(hash_str) = xt_value.strip_prefix("urn:btih:") else {
            debug!("xt parameter is not a BitTorrent info hash: {}", xt_value);
            return Ok(None);
        };

        if hash_str.len() != 40 {
            return Err(TorrentError::metadata_error_with_field(
                format!("Info hash has invalid length: {} (expected 40 hex digits)", hash_str.len()),
                "xt",
            )
            .into());
        }

        let bytes = hex::decode(hash_str).map_err(|e| {
            TorrentError::metadata_error_with_field(format!("Info hash is not valid hex: {}", e), "xt")
        })?;

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes);
        Ok(Some(hash))
    }

    /// Check if a string looks like a magnet link
    pub fn is_magnet_link(input: &str) -> bool {
        input.trim().starts_with("magnet:?")
    }
}
