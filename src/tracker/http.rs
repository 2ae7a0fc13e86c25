//! HTTP tracker announce

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use tracing::{debug, info};

use super::response::{parse_tracker_response, TrackerResponse};
use crate::cli::Config;
use crate::error::TorrentError;

/// Parameters of a single announce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Bytes still needed; 1 when the size is unknown (magnet links)
    pub left: u64,
}

impl AnnounceRequest {
    pub fn new(info_hash: [u8; 20], left: u64, config: &Config) -> Self {
        Self {
            info_hash,
            peer_id: config.peer_id,
            port: config.port,
            uploaded: 0,
            downloaded: 0,
            left,
        }
    }

    /// Full announce URL; binary fields are percent-encoded byte by byte
    pub fn url(&self, announce: &str) -> String {
        let separator = if announce.contains('?') { '&' } else { '?' };
        format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            announce,
            separator,
            urlencoding::encode_binary(&self.info_hash),
            urlencoding::encode_binary(&self.peer_id),
            self.port,
            self.uploaded,
            self.downloaded,
            self.left
        )
    }
}

/// Client for one HTTP(S) tracker
pub struct HttpTracker {
    client: Client,
    url: String,
}

impl HttpTracker {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let parsed = url::Url::parse(url).map_err(|e| {
            TorrentError::discovery_error_full("Invalid tracker URL", url, e.to_string())
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TorrentError::discovery_error_full(
                "Unsupported tracker scheme",
                url,
                parsed.scheme().to_string(),
            )
            .into());
        }

        let client = Client::builder().timeout(timeout).build().map_err(TorrentError::from)?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn announce(&self, request: &AnnounceRequest) -> Result<TrackerResponse> {
        let url = request.url(&self.url);
        debug!("Announcing to {}", url);

        let response = self.client.get(&url).send().await.map_err(TorrentError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TorrentError::discovery_error_full(
                format!("Tracker answered HTTP {}", status),
                self.url.as_str(),
                status.to_string(),
            )
            .into());
        }

        let body = response.bytes().await.map_err(TorrentError::from)?;
        parse_tracker_response(&body).map_err(|e| match e.downcast::<TorrentError>() {
            Ok(err) => err.with_context(format!("tracker {}", self.url)).into(),
            Err(other) => other,
        })
    }
}

/// Ask the tracker for peers serving `info_hash`
pub async fn discover_peers(announce: &str, info_hash: [u8; 20], left: u64, config: &Config) -> Result<Vec<SocketAddr>> {
    let tracker = HttpTracker::new(announce, config.read_timeout)?;
    let response = tracker.announce(&AnnounceRequest::new(info_hash, left, config)).await?;

    if response.peers.is_empty() {
        return Err(TorrentError::discovery_error_full("Tracker returned no peers", announce, "empty peer list").into());
    }

    info!("Discovered {} peers from {}", response.peers.len(), announce);
    Ok(response.peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn request() -> AnnounceRequest {
        let mut info_hash = [0u8; 20];
        info_hash[..4].copy_from_slice(&[0xd6, 0x9f, b'a', b' ']);
        AnnounceRequest {
            info_hash,
            peer_id: *b"-BF0001-123456789012",
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 92063,
        }
    }

    /// Serve one canned HTTP response and hand back the request line
    async fn one_shot_tracker(status: &'static str, body: Vec<u8>) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/announce", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();

            let head = format!("HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", status, body.len());
            stream.write_all(head.as_bytes()).await.unwrap();
            stream.write_all(&body).await.unwrap();
            stream.shutdown().await.unwrap();
            request.lines().next().unwrap_or_default().to_string()
        });
        (url, handle)
    }

    #[test]
    fn test_announce_url() {
        let url = request().url("http://tracker.test/announce");
        assert!(url.starts_with("http://tracker.test/announce?info_hash=%D6%9Fa%20%00%00"));
        assert!(url.contains("&peer_id=-BF0001-123456789012&port=6881"));
        assert!(url.ends_with("&uploaded=0&downloaded=0&left=92063&compact=1"));

        let url = request().url("http://tracker.test/announce?key=abc");
        assert!(url.starts_with("http://tracker.test/announce?key=abc&info_hash="));
    }

    #[test]
    fn test_rejects_udp_tracker() {
        assert!(HttpTracker::new("udp://tracker.test:80", Duration::from_secs(1)).is_err());
        assert!(HttpTracker::new("not a url", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_discover_peers() {
        let mut body = b"d8:intervali900e5:peers6:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        body.push(b'e');
        let (url, server) = one_shot_tracker("200 OK", body).await;

        let req = request();
        let config = Config { peer_id: req.peer_id, ..Config::default() };
        let peers = discover_peers(&url, req.info_hash, req.left, &config).await.unwrap();
        assert_eq!(peers, vec!["127.0.0.1:6881".parse().unwrap()]);

        let request_line = server.await.unwrap();
        assert!(request_line.starts_with("GET /announce?info_hash=%D6%9Fa%20"));
        assert!(request_line.contains("compact=1"));
    }

    #[tokio::test]
    async fn test_http_error_is_discovery_error() {
        let (url, _server) = one_shot_tracker("404 Not Found", b"nope".to_vec()).await;
        let err = discover_peers(&url, [1; 20], 1, &Config::default()).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<TorrentError>(), Some(TorrentError::DiscoveryError { .. })));
    }

    #[tokio::test]
    async fn test_failure_reason_is_discovery_error() {
        let (url, _server) = one_shot_tracker("200 OK", b"d14:failure reason7:go awaye".to_vec()).await;
        let err = discover_peers(&url, [1; 20], 1, &Config::default()).await.unwrap_err();
        assert!(err.to_string().contains("go away"));
    }
}
