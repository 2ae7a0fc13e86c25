//! Piece storage module
//!
//! Piece tasks, in-flight block collection and the write-once output buffer.

use anyhow::Result;
use sha1::{Digest, Sha1};
use tracing::{debug, trace};

use crate::error::TorrentError;
use crate::protocol::Message;
use crate::torrent::TorrentInfo;

/// One unit of scheduling: a piece to fetch and the hash it must match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceTask {
    /// Piece index
    pub index: u32,
    /// Expected SHA1 hash
    pub hash: [u8; 20],
    /// Piece size in bytes
    pub size: u32,
}

impl PieceTask {
    /// One task per piece, in index order
    pub fn plan(info: &TorrentInfo) -> Result<Vec<PieceTask>> {
        (0..info.piece_count()).map(|i| Self::for_piece(info, i)).collect()
    }

    /// Task for a single piece index
    pub fn for_piece(info: &TorrentInfo, index: usize) -> Result<PieceTask> {
        let (hash, size) = info
            .piece_hash(index)
            .zip(info.piece_size(index))
            .ok_or_else(|| {
                TorrentError::metadata_error_with_field(
                    format!("Piece {} out of range ({} pieces)", index, info.piece_count()),
                    "pieces",
                )
            })?;

        let size = u32::try_from(size).map_err(|_| {
            TorrentError::metadata_error_with_field(format!("Piece size {} too large", size), "piece length")
        })?;

        Ok(PieceTask {
            index: index as u32,
            hash,
            size,
        })
    }

    /// Request messages covering the whole piece
    pub fn block_requests(&self, block_size: u32) -> Vec<Message> {
        (0..self.size)
            .step_by(block_size as usize)
            .map(|begin| Message::Request {
                index: self.index,
                begin,
                length: block_size.min(self.size - begin),
            })
            .collect()
    }

    /// Check assembled data against the expected hash
    pub fn verify(&self, data: &[u8]) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let hash: [u8; 20] = hasher.finalize().into();

        if hash != self.hash {
            debug!(
                "Piece {} hash mismatch: expected {}, got {}",
                self.index,
                hex::encode(self.hash),
                hex::encode(hash)
            );
        }
        hash == self.hash
    }
}

/// A message that did not contribute a block to the current piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoredMessage {
    KeepAlive,
    /// A block for a different piece
    OtherPiece { index: u32 },
    /// A block we already hold
    Duplicate { begin: u32 },
    /// Any non-piece message, by wire ID
    NonPiece(u8),
}

/// Result of feeding one message to a `PieceBuffer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Stored,
    Ignored(IgnoredMessage),
}

/// Reassembles the blocks of a single piece, in any arrival order
#[derive(Debug)]
pub struct PieceBuffer {
    task: PieceTask,
    block_size: u32,
    data: Vec<u8>,
    received: Vec<bool>,
    received_bytes: u32,
}

impl PieceBuffer {
    pub fn new(task: PieceTask, block_size: u32) -> Self {
        let blocks = task.size.div_ceil(block_size) as usize;
        Self {
            task,
            block_size,
            data: vec![0u8; task.size as usize],
            received: vec![false; blocks],
            received_bytes: 0,
        }
    }

    /// Feed one message received while this piece is in flight
    pub fn accept(&mut self, message: Message) -> Result<BlockOutcome> {
        let (index, begin, block) = match message {
            Message::Piece { index, begin, block } => (index, begin, block),
            Message::KeepAlive => return Ok(BlockOutcome::Ignored(IgnoredMessage::KeepAlive)),
            Message::Choke => {
                return Err(TorrentError::transport_error(format!(
                    "Peer choked us with piece {} incomplete ({}/{} bytes)",
                    self.task.index, self.received_bytes, self.task.size
                ))
                .into())
            }
            other => {
                let id = other.raw_id().unwrap_or_default();
                trace!("Ignoring message {} while downloading piece {}", id, self.task.index);
                return Ok(BlockOutcome::Ignored(IgnoredMessage::NonPiece(id)));
            }
        };

        if index != self.task.index {
            trace!("Ignoring block for piece {} while downloading {}", index, self.task.index);
            return Ok(BlockOutcome::Ignored(IgnoredMessage::OtherPiece { index }));
        }

        if begin % self.block_size != 0 || begin >= self.task.size {
            return Err(TorrentError::protocol_error_with_source(
                format!("Block offset {} invalid for piece {}", begin, index),
                format!("piece size {}, block size {}", self.task.size, self.block_size),
            )
            .into());
        }

        let expected = self.block_size.min(self.task.size - begin);
        if block.len() != expected as usize {
            return Err(TorrentError::protocol_error_with_source(
                format!("Block at {} of piece {} has wrong length", begin, index),
                format!("expected {}, got {}", expected, block.len()),
            )
            .into());
        }

        let slot = (begin / self.block_size) as usize;
        if self.received[slot] {
            trace!("Duplicate block at {} for piece {}", begin, index);
            return Ok(BlockOutcome::Ignored(IgnoredMessage::Duplicate { begin }));
        }

        let start = begin as usize;
        self.data[start..start + block.len()].copy_from_slice(&block);
        self.received[slot] = true;
        self.received_bytes += expected;
        Ok(BlockOutcome::Stored)
    }

    pub fn is_complete(&self) -> bool {
        self.received_bytes == self.task.size
    }

    pub fn received_bytes(&self) -> u32 {
        self.received_bytes
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// One slot per piece; each slot is written exactly once
#[derive(Debug)]
pub struct AssembledOutput {
    slots: Vec<Option<Vec<u8>>>,
    filled: usize,
}

impl AssembledOutput {
    pub fn new(piece_count: usize) -> Self {
        Self {
            slots: vec![None; piece_count],
            filled: 0,
        }
    }

    /// Store a verified piece; a second write to the same slot is an error
    pub fn store(&mut self, index: u32, data: Vec<u8>) -> Result<()> {
        let slot = self.slots.get_mut(index as usize).ok_or_else(|| {
            TorrentError::integrity_error_for_piece("Piece index outside the output buffer", index)
        })?;

        if slot.is_some() {
            return Err(TorrentError::integrity_error_for_piece("Piece slot written twice", index).into());
        }

        *slot = Some(data);
        self.filled += 1;
        Ok(())
    }

    pub fn is_filled(&self, index: u32) -> bool {
        self.slots.get(index as usize).is_some_and(Option::is_some)
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.slots.len()
    }

    /// Indices not yet written
    pub fn missing(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Remove one stored piece
    pub fn take(&mut self, index: u32) -> Option<Vec<u8>> {
        let data = self.slots.get_mut(index as usize)?.take()?;
        self.filled -= 1;
        Some(data)
    }

    /// Concatenate all slots in index order
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if !self.is_complete() {
            return Err(TorrentError::integrity_error(format!(
                "Download incomplete: missing pieces {:?}",
                self.missing()
            ))
            .into());
        }
        Ok(self.slots.into_iter().flatten().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_for(data: &[u8], index: u32) -> PieceTask {
        PieceTask {
            index,
            hash: TorrentInfo::generate_info_hash(data),
            size: data.len() as u32,
        }
    }

    fn piece(index: u32, begin: u32, block: &[u8]) -> Message {
        Message::Piece { index, begin, block: block.to_vec() }
    }

    #[test]
    fn test_block_requests() {
        let task = PieceTask { index: 3, hash: [0; 20], size: 40 };
        let requests = task.block_requests(16);
        assert_eq!(
            requests,
            vec![
                Message::Request { index: 3, begin: 0, length: 16 },
                Message::Request { index: 3, begin: 16, length: 16 },
                Message::Request { index: 3, begin: 32, length: 8 },
            ]
        );
    }

    #[test]
    fn test_plan_uses_piece_sizes() {
        let info = TorrentInfo {
            announce: String::new(),
            info_hash: [0; 20],
            piece_length: 262144,
            length: 1000000,
            name: "x".to_string(),
            pieces: vec![[1; 20]; 4],
        };
        let tasks = PieceTask::plan(&info).unwrap();
        assert_eq!(tasks.len(), 4);
        assert_eq!(tasks[0].size, 262144);
        assert_eq!(tasks[3].size, 1000000 - 3 * 262144);
        assert!(PieceTask::for_piece(&info, 4).is_err());
    }

    #[test]
    fn test_out_of_order_blocks() {
        let data: Vec<u8> = (0..40).collect();
        let task = task_for(&data, 0);
        let mut buffer = PieceBuffer::new(task, 16);

        assert_eq!(buffer.accept(piece(0, 32, &data[32..])).unwrap(), BlockOutcome::Stored);
        assert_eq!(buffer.accept(piece(0, 0, &data[..16])).unwrap(), BlockOutcome::Stored);
        assert!(!buffer.is_complete());
        assert_eq!(buffer.accept(piece(0, 16, &data[16..32])).unwrap(), BlockOutcome::Stored);
        assert!(buffer.is_complete());

        let assembled = buffer.into_data();
        assert_eq!(assembled, data);
        assert!(task.verify(&assembled));
    }

    #[test]
    fn test_ignored_message_classes() {
        let data = vec![5u8; 16];
        let mut buffer = PieceBuffer::new(task_for(&data, 2), 16);

        assert_eq!(
            buffer.accept(Message::KeepAlive).unwrap(),
            BlockOutcome::Ignored(IgnoredMessage::KeepAlive)
        );
        assert_eq!(
            buffer.accept(piece(1, 0, &data)).unwrap(),
            BlockOutcome::Ignored(IgnoredMessage::OtherPiece { index: 1 })
        );
        assert_eq!(
            buffer.accept(Message::Have { piece_index: 0 }).unwrap(),
            BlockOutcome::Ignored(IgnoredMessage::NonPiece(4))
        );
        assert_eq!(buffer.accept(piece(2, 0, &data)).unwrap(), BlockOutcome::Stored);
        assert_eq!(
            buffer.accept(piece(2, 0, &data)).unwrap(),
            BlockOutcome::Ignored(IgnoredMessage::Duplicate { begin: 0 })
        );
        assert_eq!(buffer.received_bytes(), 16);
    }

    #[test]
    fn test_bad_blocks_are_protocol_violations() {
        let data = vec![0u8; 40];
        let task = task_for(&data, 0);

        for message in [
            piece(0, 8, &data[..16]),
            piece(0, 48, &data[..16]),
            piece(0, 0, &data[..10]),
            piece(0, 32, &data[..16]),
        ] {
            let err = PieceBuffer::new(task, 16).accept(message).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<TorrentError>(),
                Some(TorrentError::ProtocolViolation { .. })
            ));
        }
    }

    #[test]
    fn test_choke_mid_piece() {
        let mut buffer = PieceBuffer::new(task_for(&[0u8; 16], 0), 16);
        let err = buffer.accept(Message::Choke).unwrap_err();
        assert!(err.downcast_ref::<TorrentError>().unwrap().is_transport());
    }

    #[test]
    fn test_corrupted_piece_fails_verification() {
        let data = vec![7u8; 32];
        let task = task_for(&data, 0);
        let mut corrupted = data.clone();
        corrupted[31] ^= 0xff;

        assert!(task.verify(&data));
        assert!(!task.verify(&corrupted));
    }

    #[test]
    fn test_assembled_output_write_once() {
        let mut output = AssembledOutput::new(3);
        output.store(1, vec![2, 2]).unwrap();
        assert!(output.is_filled(1));
        assert!(output.store(1, vec![9]).is_err());
        assert!(output.store(3, vec![9]).is_err());
        assert_eq!(output.missing(), vec![0, 2]);
        assert_eq!(output.filled(), 1);

        output.store(0, vec![1]).unwrap();
        output.store(2, vec![3, 3, 3]).unwrap();
        assert!(output.is_complete());
        assert_eq!(output.into_bytes().unwrap(), vec![1, 2, 2, 3, 3, 3]);
    }

    #[test]
    fn test_incomplete_output() {
        let mut output = AssembledOutput::new(2);
        output.store(0, vec![1]).unwrap();
        let err = output.into_bytes().unwrap_err();
        assert!(err.to_string().contains("[1]"));
    }
}
