use super::error::MetainfoError;
use super::piece_hash::PieceHash;
use crate::peer::{compute_block_count, compute_block_length};

/// Sizes and digests of every piece in a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceLayout {
    total_length: u64,
    piece_length: u32,
    hashes: Vec<PieceHash>,
}

impl PieceLayout {
    pub fn new(
        total_length: u64,
        piece_length: u32,
        hashes: Vec<PieceHash>,
    ) -> Result<Self, MetainfoError> {
        if piece_length == 0 {
            return Err(MetainfoError::InvalidPieceLength(piece_length));
        }

        let expected = total_length.div_ceil(piece_length as u64) as usize;
        if hashes.len() != expected {
            return Err(MetainfoError::PieceCountMismatch {
                expected,
                actual: hashes.len(),
            });
        }

        Ok(Self {
            total_length,
            piece_length,
            hashes,
        })
    }

    /// Builds a layout from the concatenated 20-byte digests found in a
    /// torrent's `pieces` field.
    pub fn from_hash_list(
        total_length: u64,
        piece_length: u32,
        hash_list: &[u8],
    ) -> Result<Self, MetainfoError> {
        if hash_list.len() % 20 != 0 {
            return Err(MetainfoError::InvalidHashList(hash_list.len()));
        }

        let hashes = hash_list
            .chunks_exact(20)
            .filter_map(PieceHash::from_bytes)
            .collect();

        Self::new(total_length, piece_length, hashes)
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Nominal piece length. Only the last piece may be shorter.
    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn piece_count(&self) -> usize {
        self.hashes.len()
    }

    pub fn contains(&self, index: u32) -> bool {
        (index as usize) < self.hashes.len()
    }

    /// Length of the piece at `index`, with the last piece clamped to the
    /// remainder of the total length.
    pub fn piece_len(&self, index: u32) -> Option<u32> {
        if !self.contains(index) {
            return None;
        }
        let offset = index as u64 * self.piece_length as u64;
        let remaining = self.total_length - offset;
        Some(remaining.min(self.piece_length as u64) as u32)
    }

    pub fn hash(&self, index: u32) -> Option<&PieceHash> {
        self.hashes.get(index as usize)
    }

    pub fn hashes(&self) -> &[PieceHash] {
        &self.hashes
    }

    pub fn block_count(&self, index: u32, block_size: u32) -> Option<u32> {
        self.piece_len(index)
            .map(|len| compute_block_count(len, block_size))
    }

    /// Length of the block starting at `block_offset`, or `None` if the
    /// offset is not block aligned or lies outside the piece.
    pub fn block_len(&self, index: u32, block_offset: u32, block_size: u32) -> Option<u32> {
        let piece_len = self.piece_len(index)?;
        if block_offset % block_size != 0 || block_offset >= piece_len {
            return None;
        }
        Some(compute_block_length(piece_len, block_offset / block_size, block_size))
    }
}
