use super::error::PieceError;
use crate::metainfo::PieceHash;
use crate::peer::{compute_block_count, compute_block_length, BlockRequest};
use bytes::{Bytes, BytesMut};

/// Lifecycle of a [`Piece`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// Some blocks are still missing.
    InProgress,
    /// Every block arrived and the digest matched.
    Completed,
    /// Every block arrived and the digest did not match.
    Corrupted,
}

/// What a call to [`Piece::put_block`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The block was stored; more blocks are needed.
    Accepted,
    /// The block had already been stored. Nothing changed.
    Duplicate,
    /// The block completed the piece and the digest matched. Carries the
    /// assembled piece.
    Completed(Bytes),
    /// The block completed the piece but the digest did not match. The data
    /// is discarded.
    Corrupted,
}

/// One piece being assembled from blocks.
///
/// A `Piece` is created by [`PieceManager::check_out`](super::PieceManager::check_out)
/// and owned by the session that checked it out until it completes, turns
/// out corrupted, or is abandoned.
#[derive(Debug)]
pub struct Piece {
    index: u32,
    hash: PieceHash,
    length: u32,
    block_size: u32,
    data: BytesMut,
    blocks: Vec<bool>,
    completed_blocks: u32,
    state: PieceState,
}

impl Piece {
    /// Creates an empty, zero-filled piece.
    pub fn new(index: u32, hash: PieceHash, length: u32, block_size: u32) -> Self {
        let block_count = compute_block_count(length, block_size);
        Self {
            index,
            hash,
            length,
            block_size,
            data: BytesMut::zeroed(length as usize),
            blocks: vec![false; block_count as usize],
            completed_blocks: 0,
            state: PieceState::InProgress,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn hash(&self) -> &PieceHash {
        &self.hash
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn completed_blocks(&self) -> u32 {
        self.completed_blocks
    }

    pub fn state(&self) -> PieceState {
        self.state
    }

    pub fn is_completed(&self) -> bool {
        self.state == PieceState::Completed
    }

    pub fn is_corrupted(&self) -> bool {
        self.state == PieceState::Corrupted
    }

    pub fn has_block(&self, block_offset: u32) -> bool {
        block_offset % self.block_size == 0
            && self
                .blocks
                .get((block_offset / self.block_size) as usize)
                .copied()
                .unwrap_or(false)
    }

    /// Length of the block at `block_index`; the last block may be short.
    pub fn block_len(&self, block_index: u32) -> u32 {
        compute_block_length(self.length, block_index, self.block_size)
    }

    /// Requests for every block not yet stored.
    pub fn missing_blocks(&self) -> impl Iterator<Item = BlockRequest> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, done)| !**done)
            .map(move |(i, _)| {
                let i = i as u32;
                BlockRequest::new(self.index, i * self.block_size, self.block_len(i))
            })
    }

    /// Stores one block.
    ///
    /// Delivering the same block twice is a no-op. When the last block
    /// arrives the whole piece is hashed and the piece becomes either
    /// completed or corrupted.
    pub fn put_block(&mut self, block_offset: u32, data: &[u8]) -> Result<BlockOutcome, PieceError> {
        if block_offset % self.block_size != 0 {
            return Err(PieceError::MisalignedOffset {
                index: self.index,
                offset: block_offset,
            });
        }
        if block_offset >= self.length {
            return Err(PieceError::OffsetOutOfRange {
                index: self.index,
                offset: block_offset,
            });
        }

        let block_index = block_offset / self.block_size;
        let expected = self.block_len(block_index);
        if data.len() != expected as usize {
            return Err(PieceError::InvalidBlockLength {
                index: self.index,
                offset: block_offset,
                expected,
                actual: data.len(),
            });
        }

        if self.blocks[block_index as usize] {
            return Ok(BlockOutcome::Duplicate);
        }

        let start = block_offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        self.blocks[block_index as usize] = true;
        self.completed_blocks += 1;

        if self.completed_blocks < self.block_count() {
            return Ok(BlockOutcome::Accepted);
        }

        Ok(self.finish())
    }

    fn finish(&mut self) -> BlockOutcome {
        if self.hash.matches(&self.data[..self.length as usize]) {
            self.state = PieceState::Completed;
            BlockOutcome::Completed(std::mem::take(&mut self.data).freeze())
        } else {
            self.state = PieceState::Corrupted;
            self.data = BytesMut::new();
            BlockOutcome::Corrupted
        }
    }
}
