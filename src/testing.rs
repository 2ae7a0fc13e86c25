//! In-process peer used by the transport and scheduler tests

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::bencode;
use crate::protocol::extension::{LOCAL_UT_METADATA_ID, METADATA_PIECE_SIZE};
use crate::protocol::{BitTorrentWire, ExtensionHandshake, Handshake, Message, MetadataMessage, WireProtocol};
use crate::torrent::info::info_dict_for;
use crate::torrent::TorrentInfo;

pub(crate) const MOCK_PEER_ID: [u8; 20] = *b"-MK0001-abcdefghijkl";

/// Sub-ID the mock asks us to use for `ut_metadata`
pub(crate) const MOCK_UT_METADATA_ID: u8 = 3;

/// A seeder holding the whole file in memory
#[derive(Debug, Clone)]
pub(crate) struct MockPeer {
    pub content: Vec<u8>,
    pub piece_length: usize,
    pub info_hash: [u8; 20],
    /// Raw info dictionary served over `ut_metadata`
    pub metadata: Option<Vec<u8>>,
    pub reject_metadata: bool,
    /// Answer every request with a choke
    pub choke_on_request: bool,
    /// Number of piece servings to corrupt, shared across connections
    pub corrupt_servings: Arc<AtomicUsize>,
}

impl MockPeer {
    pub fn new(content: Vec<u8>, piece_length: usize, info_hash: [u8; 20]) -> Self {
        Self {
            content,
            piece_length,
            info_hash,
            metadata: None,
            reject_metadata: false,
            choke_on_request: false,
            corrupt_servings: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A seeder for `content` together with the torrent describing it
    pub fn seeding(content: Vec<u8>, piece_length: usize) -> (Self, TorrentInfo) {
        let metadata = bencode::encode(&info_dict_for("payload.bin", piece_length, &content));
        let info = TorrentInfo::from_metadata("http://tracker.test/announce", &metadata).unwrap();
        let mut peer = Self::new(content, piece_length, info.info_hash);
        peer.metadata = Some(metadata);
        (peer, info)
    }

    pub fn corrupting(self, servings: usize) -> Self {
        self.corrupt_servings.store(servings, Ordering::SeqCst);
        self
    }

    /// Listen on an ephemeral port and serve every connection
    pub async fn spawn(self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = Arc::new(self);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let peer = Arc::clone(&peer);
                tokio::spawn(async move {
                    let _ = peer.serve(stream).await;
                });
            }
        });
        addr
    }

    pub async fn serve<S: AsyncRead + AsyncWrite + Unpin>(&self, mut stream: S) -> Result<()> {
        let mut wire = BitTorrentWire;
        let theirs = wire.read_handshake(&mut stream).await?;

        let ours = if self.metadata.is_some() {
            Handshake::with_extensions(self.info_hash, MOCK_PEER_ID)
        } else {
            Handshake::new(self.info_hash, MOCK_PEER_ID)
        };
        wire.write_handshake(&mut stream, &ours).await?;

        let pieces = self.content.len().div_ceil(self.piece_length);
        let mut bitfield = vec![0u8; pieces.div_ceil(8)];
        for index in 0..pieces {
            bitfield[index / 8] |= 0x80 >> (index % 8);
        }
        wire.write_message(&mut stream, &Message::Bitfield { bitfield }).await?;

        if let Some(metadata) = &self.metadata {
            if theirs.supports_extensions() {
                let mut handshake = ExtensionHandshake::default();
                handshake.extensions.insert("ut_metadata".to_string(), MOCK_UT_METADATA_ID);
                handshake.metadata_size = Some(metadata.len());
                handshake.client = Some("mock 0.1".to_string());
                let message = Message::Extended { id: 0, payload: handshake.encode() };
                wire.write_message(&mut stream, &message).await?;
            }
        }

        loop {
            let message = match wire.read_message(&mut stream).await {
                Ok(message) => message,
                Err(_) => return Ok(()),
            };

            match message {
                Message::Interested => {
                    let replies = [Message::KeepAlive, Message::Have { piece_index: 0 }, Message::Unchoke];
                    wire.write_messages(&mut stream, &replies).await?;
                }
                Message::Request { index, begin, length } => {
                    if self.choke_on_request {
                        wire.write_message(&mut stream, &Message::Choke).await?;
                        continue;
                    }

                    let start = index as usize * self.piece_length + begin as usize;
                    let mut block = self.content[start..start + length as usize].to_vec();
                    if begin == 0
                        && self
                            .corrupt_servings
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                            .is_ok()
                    {
                        block[0] ^= 0xff;
                    }
                    wire.write_message(&mut stream, &Message::Piece { index, begin, block }).await?;
                }
                Message::Extended { id: MOCK_UT_METADATA_ID, payload } => {
                    let metadata = self.metadata.as_deref().unwrap_or_default();
                    let piece = MetadataMessage::decode(&payload)?.piece();
                    let reply = if self.reject_metadata {
                        MetadataMessage::Reject { piece }
                    } else {
                        let start = piece as usize * METADATA_PIECE_SIZE;
                        let end = (start + METADATA_PIECE_SIZE).min(metadata.len());
                        MetadataMessage::Data {
                            piece,
                            total_size: Some(metadata.len()),
                            data: metadata[start..end].to_vec(),
                        }
                    };
                    let message = Message::Extended { id: LOCAL_UT_METADATA_ID, payload: reply.encode() };
                    wire.write_message(&mut stream, &message).await?;
                }
                _ => {}
            }
        }
    }
}
