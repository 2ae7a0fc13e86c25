//! BitTorrent protocol messages
//!
//! Defines all message types used in the BitTorrent protocol.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tracing::{error, trace};

use crate::error::TorrentError;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            20 => Ok(MessageId::Extended),
            _ => Err(TorrentError::protocol_error_with_source(
                "Invalid message ID",
                format!("value: {}", value),
            )
            .into()),
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
    /// Extension protocol message: sub-ID followed by its payload
    Extended { id: u8, payload: Vec<u8> },
    /// A message ID we do not understand; callers may ignore it
    Unknown { id: u8, payload: Vec<u8> },
}

impl Message {
    /// Get the message ID (returns None for KeepAlive and unknown IDs)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
            Message::Extended { .. } => Some(MessageId::Extended),
            Message::KeepAlive | Message::Unknown { .. } => None,
        }
    }

    /// The raw ID byte on the wire (None for KeepAlive)
    pub fn raw_id(&self) -> Option<u8> {
        match self {
            Message::Unknown { id, .. } => Some(*id),
            other => other.message_id().map(|id| id as u8),
        }
    }

    /// Get the message length (excluding the length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Port { .. } => 3,
            Message::Extended { payload, .. } => 2 + payload.len() as u32,
            Message::Unknown { payload, .. } => 1 + payload.len() as u32,
        }
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        self.serialize_into(&mut buf);
        buf.to_vec()
    }

    /// Append the framed message to `buf`
    pub fn serialize_into(&self, buf: &mut BytesMut) {
        trace!("Serializing message: {:?}", self.raw_id());
        buf.put_u32(self.length());

        if let Some(id) = self.raw_id() {
            buf.put_u8(id);
        }

        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { listen_port } => buf.put_u16(*listen_port),
            Message::Extended { id, payload } => {
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
            Message::Unknown { payload, .. } => buf.put_slice(payload),
        }
    }

    /// Deserialize a message from bytes (including length prefix)
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("Deserializing message from {} bytes", data.len());
        let mut buf = BytesMut::from(data);

        if buf.remaining() < 4 {
            error!("Message shorter than its length prefix");
            return Err(TorrentError::protocol_error("Message shorter than its length prefix").into());
        }

        let length = buf.get_u32() as usize;

        // KeepAlive has length 0 and no message ID
        if length == 0 {
            trace!("Received KeepAlive message");
            return Ok(Message::KeepAlive);
        }

        if buf.remaining() != length {
            error!("Message length mismatch: prefix says {}, have {}", length, buf.remaining());
            return Err(TorrentError::protocol_error_with_source(
                "Message length mismatch",
                format!("prefix says {}, have {}", length, buf.remaining()),
            )
            .into());
        }

        let id = buf.get_u8();
        let Ok(message_id) = MessageId::try_from(id) else {
            trace!("Received unknown message ID {}", id);
            return Ok(Message::Unknown { id, payload: buf.to_vec() });
        };

        let message = match message_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                require(&buf, 4, "Have")?;
                Message::Have { piece_index: buf.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: buf.to_vec() },
            MessageId::Request => {
                require(&buf, 12, "Request")?;
                Message::Request {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                }
            }
            MessageId::Piece => {
                require(&buf, 8, "Piece")?;
                let index = buf.get_u32();
                let begin = buf.get_u32();
                Message::Piece { index, begin, block: buf.to_vec() }
            }
            MessageId::Cancel => {
                require(&buf, 12, "Cancel")?;
                Message::Cancel {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                }
            }
            MessageId::Port => {
                require(&buf, 2, "Port")?;
                Message::Port { listen_port: buf.get_u16() }
            }
            MessageId::Extended => {
                require(&buf, 1, "Extended")?;
                let id = buf.get_u8();
                Message::Extended { id, payload: buf.to_vec() }
            }
        };

        trace!("Received {:?} ({} bytes)", message_id, length);
        Ok(message)
    }
}

fn require(buf: &BytesMut, needed: usize, name: &str) -> Result<()> {
    if buf.remaining() < needed {
        error!("{} message too short: expected {} bytes, got {}", name, needed, buf.remaining());
        return Err(TorrentError::protocol_error_with_source(
            format!("{} message too short", name),
            format!("expected {} bytes, got {}", needed, buf.remaining()),
        )
        .into());
    }
    Ok(())
}
