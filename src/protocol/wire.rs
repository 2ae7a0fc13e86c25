//! Wire protocol utilities
//!
//! Framing of handshakes and length-prefixed messages over an async stream.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, trace};

use super::handshake::HANDSHAKE_LEN;
use super::{Handshake, Message};
use crate::error::TorrentError;

/// Largest message accepted from a peer (prefix value)
pub const MAX_MESSAGE_LEN: usize = 1 << 21;

/// WireProtocol trait for protocol utilities
#[allow(async_fn_in_trait)]
pub trait WireProtocol {
    /// Read a complete message from the stream
    async fn read_message<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Message>;

    /// Write a message to the stream
    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()>;

    /// Write several messages with a single flush
    async fn write_messages<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, messages: &[Message]) -> Result<()>;

    /// Read a handshake from the stream
    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake>;

    /// Write a handshake to the stream
    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()>;
}

/// Default implementation of WireProtocol
#[derive(Debug, Default, Clone, Copy)]
pub struct BitTorrentWire;

impl WireProtocol for BitTorrentWire {
    async fn read_message<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Message> {
        let mut length_buf = [0u8; 4];
        reader.read_exact(&mut length_buf).await.map_err(TorrentError::from)?;
        let length = u32::from_be_bytes(length_buf) as usize;

        // Keep-alive: no ID byte follows
        if length == 0 {
            return Ok(Message::KeepAlive);
        }

        if length > MAX_MESSAGE_LEN {
            error!("Message length {} exceeds limit {}", length, MAX_MESSAGE_LEN);
            return Err(TorrentError::protocol_error_with_source(
                "Message too large",
                format!("{} bytes", length),
            )
            .into());
        }

        let mut full_message = BytesMut::with_capacity(4 + length);
        full_message.put_slice(&length_buf);
        full_message.resize(4 + length, 0);
        reader.read_exact(&mut full_message[4..]).await.map_err(TorrentError::from)?;

        Message::deserialize(&full_message)
    }

    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()> {
        trace!("Writing message {:?}", message.raw_id());
        let serialized = message.serialize();
        writer.write_all(&serialized).await.map_err(TorrentError::from)?;
        writer.flush().await.map_err(TorrentError::from)?;
        Ok(())
    }

    async fn write_messages<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, messages: &[Message]) -> Result<()> {
        let mut buf = BytesMut::new();
        for message in messages {
            message.serialize_into(&mut buf);
        }
        trace!("Writing {} messages in {} bytes", messages.len(), buf.len());
        writer.write_all(&buf).await.map_err(TorrentError::from)?;
        writer.flush().await.map_err(TorrentError::from)?;
        Ok(())
    }

    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader.read_exact(&mut buf).await.map_err(TorrentError::from)?;
        Handshake::deserialize(&buf)
    }

    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        writer.write_all(&handshake.serialize()).await.map_err(TorrentError::from)?;
        writer.flush().await.map_err(TorrentError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_message_over_stream() {
        let (mut a, mut b) = duplex(1024);
        let mut wire = BitTorrentWire;

        let sent = Message::Piece { index: 2, begin: 0, block: vec![7; 32] };
        wire.write_message(&mut a, &sent).await.unwrap();
        assert_eq!(wire.read_message(&mut b).await.unwrap(), sent);
    }

    #[tokio::test]
    async fn test_keepalive_then_message() {
        let (mut a, mut b) = duplex(1024);
        a.write_all(&[0, 0, 0, 0, 0, 0, 0, 1, 1]).await.unwrap();

        let mut wire = BitTorrentWire;
        assert_eq!(wire.read_message(&mut b).await.unwrap(), Message::KeepAlive);
        assert_eq!(wire.read_message(&mut b).await.unwrap(), Message::Unchoke);
    }

    #[tokio::test]
    async fn test_batched_write() {
        let (mut a, mut b) = duplex(1024);
        let mut wire = BitTorrentWire;
        let requests = vec![
            Message::Request { index: 0, begin: 0, length: 4 },
            Message::Request { index: 0, begin: 4, length: 4 },
        ];
        wire.write_messages(&mut a, &requests).await.unwrap();

        assert_eq!(wire.read_message(&mut b).await.unwrap(), requests[0]);
        assert_eq!(wire.read_message(&mut b).await.unwrap(), requests[1]);
    }

    #[tokio::test]
    async fn test_short_read_is_transport_error() {
        let (mut a, mut b) = duplex(1024);
        a.write_all(&[0, 0, 0, 5, 7]).await.unwrap();
        drop(a);

        let err = BitTorrentWire.read_message(&mut b).await.unwrap_err();
        let err = err.downcast_ref::<TorrentError>().unwrap();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let (mut a, mut b) = duplex(1024);
        a.write_all(&(MAX_MESSAGE_LEN as u32 + 1).to_be_bytes()).await.unwrap();

        let err = BitTorrentWire.read_message(&mut b).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TorrentError>(),
            Some(TorrentError::ProtocolViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_handshake_over_stream() {
        let (mut a, mut b) = duplex(1024);
        let mut wire = BitTorrentWire;
        let handshake = Handshake::with_extensions([4u8; 20], [5u8; 20]);

        wire.write_handshake(&mut a, &handshake).await.unwrap();
        assert_eq!(wire.read_handshake(&mut b).await.unwrap(), handshake);
    }
}
