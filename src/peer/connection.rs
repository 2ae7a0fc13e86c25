//! Peer connection module
//!
//! One session with a remote peer: handshake, message exchange with read
//! deadlines, pipelined piece download and `ut_metadata` exchange.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::cli::Config;
use crate::error::TorrentError;
use crate::peer::{Peer, PeerState};
use crate::protocol::extension::{EXTENSION_HANDSHAKE_ID, LOCAL_UT_METADATA_ID};
use crate::protocol::{
    BitTorrentWire, ExtensionHandshake, Handshake, Message, MessageId, MetadataMessage, WireProtocol,
};
use crate::storage::{BlockOutcome, PieceBuffer, PieceTask};

/// Represents a connected peer
pub struct PeerConnection<S = TcpStream> {
    /// Peer information
    pub peer: Peer,
    stream: S,
    wire: BitTorrentWire,
    read_timeout: Duration,
    handshake_completed: bool,
}

impl PeerConnection<TcpStream> {
    /// Dial a peer, bounded by the configured connect timeout
    pub async fn connect(addr: SocketAddr, config: &Config) -> Result<Self> {
        debug!("Connecting to peer: {}", addr);

        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                warn!("Connection timeout to {}", addr);
                TorrentError::transport_error_full(
                    "Connection timeout",
                    addr.to_string(),
                    format!("no answer within {:?}", config.connect_timeout),
                )
            })?
            .map_err(|e| {
                debug!("Failed to connect to {}: {}", addr, e);
                TorrentError::transport_error_full("Failed to connect", addr.to_string(), e.to_string())
            })?;

        let mut connection = Self::from_stream(stream, addr, config.read_timeout);
        connection.peer.state = PeerState::Connecting;
        Ok(connection)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> PeerConnection<S> {
    /// Wrap an already-established stream
    pub fn from_stream(stream: S, addr: SocketAddr, read_timeout: Duration) -> Self {
        Self {
            peer: Peer::new(addr),
            stream,
            wire: BitTorrentWire,
            read_timeout,
            handshake_completed: false,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.peer.addr
    }

    pub fn is_handshake_completed(&self) -> bool {
        self.handshake_completed
    }

    /// Send our handshake, optionally advertising the extension protocol
    pub async fn send_handshake(&mut self, info_hash: [u8; 20], peer_id: [u8; 20], extensions: bool) -> Result<()> {
        let handshake = if extensions {
            Handshake::with_extensions(info_hash, peer_id)
        } else {
            Handshake::new(info_hash, peer_id)
        };

        trace!("Sending handshake to {} (extensions: {})", self.peer.addr, extensions);
        self.wire
            .write_handshake(&mut self.stream, &handshake)
            .await
            .map_err(|e| self.annotate(e))
    }

    /// Read the peer's handshake, bounded by the read timeout
    pub async fn read_handshake(&mut self) -> Result<Handshake> {
        let (addr, read_timeout) = (self.peer.addr, self.read_timeout);
        timeout(read_timeout, self.wire.read_handshake(&mut self.stream))
            .await
            .map_err(|_| {
                TorrentError::transport_error_full(
                    "Timed out waiting for handshake",
                    addr.to_string(),
                    format!("{:?}", read_timeout),
                )
            })?
            .map_err(|e| self.annotate(e))
    }

    /// Exchange handshakes and check the peer is serving `info_hash`
    pub async fn handshake(&mut self, info_hash: [u8; 20], peer_id: [u8; 20], extensions: bool) -> Result<Handshake> {
        self.send_handshake(info_hash, peer_id, extensions).await?;
        let theirs = self.read_handshake().await?;

        if !theirs.validate(&info_hash) {
            warn!("Handshake with {} failed: info hash mismatch", self.peer.addr);
            return Err(self.annotate(TorrentError::protocol_error_with_source(
                "Handshake info hash mismatch",
                format!("expected {}, got {}", hex::encode(info_hash), hex::encode(theirs.info_hash)),
            )));
        }

        self.peer.peer_id = Some(theirs.peer_id);
        self.peer.supports_extensions = theirs.supports_extensions();
        self.peer.state = PeerState::Connected;
        self.handshake_completed = true;

        debug!(
            "Handshake completed with {} (peer id {}, extensions: {})",
            self.peer.addr,
            hex::encode(theirs.peer_id),
            self.peer.supports_extensions
        );
        Ok(theirs)
    }

    /// Send a message to the peer
    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        self.ensure_handshake()?;
        trace!("Sending {:?} to {}", message.message_id(), self.peer.addr);
        self.wire
            .write_message(&mut self.stream, message)
            .await
            .map_err(|e| self.annotate(e))
    }

    /// Send several messages with a single flush
    pub async fn send_messages(&mut self, messages: &[Message]) -> Result<()> {
        self.ensure_handshake()?;
        trace!("Sending {} messages to {}", messages.len(), self.peer.addr);
        self.wire
            .write_messages(&mut self.stream, messages)
            .await
            .map_err(|e| self.annotate(e))
    }

    /// Receive a message from the peer, bounded by the read timeout
    pub async fn receive_message(&mut self) -> Result<Message> {
        self.ensure_handshake()?;

        let (addr, read_timeout) = (self.peer.addr, self.read_timeout);
        let message = timeout(read_timeout, self.wire.read_message(&mut self.stream))
            .await
            .map_err(|_| {
                TorrentError::transport_error_full(
                    "Timed out waiting for message",
                    addr.to_string(),
                    format!("{:?}", read_timeout),
                )
            })?
            .map_err(|e| self.annotate(e))?;

        trace!("Received {:?} from {}", message.message_id(), self.peer.addr);
        self.observe(&message);
        Ok(message)
    }

    /// Read until a message of the given kind arrives.
    ///
    /// Messages that carry no reply obligation (keep-alives, `have`,
    /// extension traffic, unknown IDs) are skipped; anything else is a
    /// protocol violation.
    pub async fn expect_message(&mut self, expected: MessageId) -> Result<Message> {
        loop {
            let message = self.receive_message().await?;
            if message.message_id() == Some(expected) {
                return Ok(message);
            }

            if skippable_while_waiting(&message, expected) {
                trace!("Skipping {:?} from {} while waiting for {:?}", message.raw_id(), self.peer.addr, expected);
                continue;
            }

            return Err(self.annotate(TorrentError::protocol_error(format!(
                "Expected {:?}, got message id {:?}",
                expected,
                message.raw_id()
            ))));
        }
    }

    /// Bitfield, interested, unchoke: the exchange that precedes requests
    pub async fn prepare_download(&mut self) -> Result<()> {
        if self.peer.bitfield.is_none() {
            self.expect_message(MessageId::Bitfield).await?;
        }

        self.send_message(&Message::Interested).await?;
        self.peer.am_interested = true;

        if self.peer.peer_choking {
            self.expect_message(MessageId::Unchoke).await?;
        }

        debug!(
            "Peer {} unchoked us ({} pieces advertised)",
            self.peer.addr,
            self.peer.piece_count()
        );
        Ok(())
    }

    /// Download one piece with all of its block requests in flight at once.
    ///
    /// The assembled data is checked against the task's hash; a mismatch is
    /// an `IntegrityFailure` and leaves the connection usable.
    pub async fn download_piece(&mut self, task: &PieceTask, block_size: u32) -> Result<Vec<u8>> {
        if !self.peer.can_request() {
            return Err(self.annotate(TorrentError::protocol_error(format!(
                "Cannot request piece {}: peer is not ready",
                task.index
            ))));
        }

        let requests = task.block_requests(block_size);
        debug!(
            "Requesting piece {} ({} bytes, {} blocks) from {}",
            task.index,
            task.size,
            requests.len(),
            self.peer.addr
        );
        self.send_messages(&requests).await?;

        let mut buffer = PieceBuffer::new(*task, block_size);
        while !buffer.is_complete() {
            let message = self.receive_message().await?;
            match buffer.accept(message).map_err(|e| self.annotate(e))? {
                BlockOutcome::Stored => {}
                BlockOutcome::Ignored(reason) => {
                    trace!("Ignored {:?} from {} during piece {}", reason, self.peer.addr, task.index);
                }
            }
        }

        self.peer.bytes_downloaded += u64::from(task.size);
        let data = buffer.into_data();
        if !task.verify(&data) {
            return Err(TorrentError::integrity_error_for_piece(
                format!("Piece hash mismatch from {}", self.peer.addr),
                task.index,
            )
            .into());
        }

        Ok(data)
    }

    /// Send our extension handshake and wait for the peer's
    pub async fn extension_handshake(&mut self) -> Result<ExtensionHandshake> {
        if !self.peer.supports_extensions {
            return Err(self.annotate(TorrentError::protocol_error(
                "Peer does not support the extension protocol",
            )));
        }

        let ours = Message::Extended {
            id: EXTENSION_HANDSHAKE_ID,
            payload: ExtensionHandshake::local().encode(),
        };
        self.send_message(&ours).await?;

        loop {
            if let Some(theirs) = &self.peer.extensions {
                debug!(
                    "Extension handshake with {}: ut_metadata={:?}, metadata_size={:?}",
                    self.peer.addr,
                    theirs.ut_metadata_id(),
                    theirs.metadata_size
                );
                return Ok(theirs.clone());
            }

            if let Message::Extended { id: EXTENSION_HANDSHAKE_ID, payload } =
                self.expect_message(MessageId::Extended).await?
            {
                let theirs = ExtensionHandshake::decode(&payload).map_err(|e| self.annotate(e))?;
                self.peer.extensions = Some(theirs);
            }
        }
    }

    /// Handshake with the extension bit set, then negotiate extensions
    pub async fn metadata_handshake(&mut self, info_hash: [u8; 20], peer_id: [u8; 20]) -> Result<ExtensionHandshake> {
        self.handshake(info_hash, peer_id, true).await?;
        if self.peer.bitfield.is_none() {
            self.expect_message(MessageId::Bitfield).await?;
        }
        self.extension_handshake().await
    }

    /// Fetch the raw info dictionary over `ut_metadata`, piece by piece.
    ///
    /// The concatenated bytes must hash to `info_hash`.
    pub async fn fetch_metadata(&mut self, info_hash: [u8; 20]) -> Result<Vec<u8>> {
        let theirs = match self.peer.extensions.clone() {
            Some(theirs) => theirs,
            None => self.extension_handshake().await?,
        };

        let ut_metadata = theirs.ut_metadata_id().ok_or_else(|| {
            self.annotate(TorrentError::protocol_error("Peer does not support ut_metadata"))
        })?;

        let piece_count = theirs.metadata_piece_count();
        let mut metadata = Vec::with_capacity(theirs.metadata_size.unwrap_or_default());

        for piece in 0..piece_count as u32 {
            let request = Message::Extended {
                id: ut_metadata,
                payload: MetadataMessage::Request { piece }.encode(),
            };
            self.send_message(&request).await?;

            let data = loop {
                let payload = match self.expect_message(MessageId::Extended).await? {
                    Message::Extended { id, payload } if id == LOCAL_UT_METADATA_ID || id == ut_metadata => payload,
                    _ => continue,
                };

                match MetadataMessage::decode(&payload).map_err(|e| self.annotate(e))? {
                    MetadataMessage::Data { piece: got, data, .. } if got == piece => {
                        match theirs.metadata_piece_len(piece as usize) {
                            Some(expected) if data.len() != expected => {
                                return Err(self.annotate(TorrentError::protocol_error_with_source(
                                    format!("Metadata piece {} has the wrong length", piece),
                                    format!("expected {}, received {}", expected, data.len()),
                                )));
                            }
                            _ => break data,
                        }
                    }
                    MetadataMessage::Reject { piece: got } if got == piece => {
                        return Err(self.annotate(TorrentError::protocol_error(format!(
                            "Peer rejected metadata piece {}",
                            piece
                        ))));
                    }
                    other => trace!("Ignoring metadata message {:?} for piece {}", other.piece(), piece),
                }
            };

            trace!("Metadata piece {}/{} ({} bytes) from {}", piece + 1, piece_count, data.len(), self.peer.addr);
            metadata.extend_from_slice(&data);
        }

        if let Some(size) = theirs.metadata_size {
            if metadata.len() != size {
                return Err(self.annotate(TorrentError::protocol_error_with_source(
                    "Metadata size mismatch",
                    format!("announced {}, received {}", size, metadata.len()),
                )));
            }
        }

        let hash: [u8; 20] = Sha1::digest(&metadata).into();
        if hash != info_hash {
            return Err(TorrentError::integrity_error(format!(
                "Metadata from {} hashes to {}, expected {}",
                self.peer.addr,
                hex::encode(hash),
                hex::encode(info_hash)
            ))
            .into());
        }

        info!("Fetched {} bytes of metadata from {}", metadata.len(), self.peer.addr);
        Ok(metadata)
    }

    /// Shut down the write half and mark the peer disconnected
    pub async fn close(&mut self) -> Result<()> {
        self.peer.state = PeerState::Disconnected;
        self.stream
            .shutdown()
            .await
            .map_err(|e| self.annotate(TorrentError::from(e)))
    }

    /// Track choke state, advertised pieces and the extension handshake
    fn observe(&mut self, message: &Message) {
        match message {
            Message::Choke => self.peer.peer_choking = true,
            Message::Unchoke => self.peer.peer_choking = false,
            Message::Have { piece_index } => {
                if !self.peer.set_piece(*piece_index as usize) {
                    debug!("Ignoring have {} from {}", piece_index, self.peer.addr);
                }
            }
            Message::Bitfield { bitfield } => self.peer.update_bitfield(bitfield.clone()),
            Message::Extended { id: EXTENSION_HANDSHAKE_ID, payload } => match ExtensionHandshake::decode(payload) {
                Ok(theirs) => self.peer.extensions = Some(theirs),
                Err(e) => warn!("Bad extension handshake from {}: {}", self.peer.addr, e),
            },
            _ => {}
        }
    }

    fn ensure_handshake(&self) -> Result<()> {
        if !self.handshake_completed {
            return Err(self.annotate(TorrentError::protocol_error("Handshake not completed")));
        }
        Ok(())
    }

    /// Attach this peer's address to transport and protocol errors
    fn annotate(&self, err: impl Into<anyhow::Error>) -> anyhow::Error {
        match err.into().downcast::<TorrentError>() {
            Ok(err) => err.with_peer(self.peer.addr.to_string()).into(),
            Err(other) => other,
        }
    }
}

fn skippable_while_waiting(message: &Message, expected: MessageId) -> bool {
    match message {
        Message::KeepAlive
        | Message::Have { .. }
        | Message::Bitfield { .. }
        | Message::Interested
        | Message::NotInterested
        | Message::Port { .. }
        | Message::Extended { .. }
        | Message::Unknown { .. } => true,
        Message::Choke => expected == MessageId::Unchoke,
        _ => false,
    }
}
