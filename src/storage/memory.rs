use super::error::StorageError;
use super::PieceStore;
use crate::metainfo::PieceLayout;
use crate::piece::PieceStatus;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;

/// Which part of a piece the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wanted {
    All,
    Partly,
    Nothing,
}

/// A [`PieceStore`] that keeps every piece in memory.
pub struct MemoryStorage {
    layout: Arc<PieceLayout>,
    pieces: RwLock<Vec<Option<Bytes>>>,
    wanted: RwLock<Vec<Wanted>>,
}

impl MemoryStorage {
    pub fn new(layout: Arc<PieceLayout>) -> Self {
        let count = layout.piece_count();
        Self {
            layout,
            pieces: RwLock::new(vec![None; count]),
            wanted: RwLock::new(vec![Wanted::All; count]),
        }
    }

    /// Creates a store already holding the full content.
    pub fn with_content(layout: Arc<PieceLayout>, content: &[u8]) -> Result<Self, StorageError> {
        let storage = Self::new(layout);
        let piece_length = storage.layout.piece_length() as usize;
        for (index, chunk) in content.chunks(piece_length).enumerate() {
            storage.put(index as u32, Bytes::copy_from_slice(chunk))?;
        }
        Ok(storage)
    }

    /// Marks a piece as lying entirely inside unwanted files.
    pub fn ignore(&self, index: u32) -> Result<(), StorageError> {
        self.set_wanted(index, Wanted::Nothing)
    }

    /// Marks a piece as straddling a wanted and an unwanted file.
    pub fn mark_partial(&self, index: u32) -> Result<(), StorageError> {
        self.set_wanted(index, Wanted::Partly)
    }

    pub fn stored_count(&self) -> usize {
        self.pieces.read().iter().filter(|p| p.is_some()).count()
    }

    fn set_wanted(&self, index: u32, wanted: Wanted) -> Result<(), StorageError> {
        let mut table = self.wanted.write();
        let slot = table
            .get_mut(index as usize)
            .ok_or(StorageError::InvalidPieceIndex(index))?;
        *slot = wanted;
        Ok(())
    }
}

impl PieceStore for MemoryStorage {
    fn verify(&self) -> Result<Vec<PieceStatus>, StorageError> {
        let pieces = self.pieces.read();
        let wanted = self.wanted.read();

        let statuses: Vec<PieceStatus> = pieces
            .iter()
            .zip(wanted.iter())
            .zip(self.layout.hashes())
            .map(|((data, wanted), hash)| match wanted {
                Wanted::Nothing => PieceStatus::Ignore,
                Wanted::Partly => PieceStatus::Partial,
                Wanted::All => match data {
                    Some(data) if hash.matches(data) => PieceStatus::Present,
                    _ => PieceStatus::Missing,
                },
            })
            .collect();

        tracing::debug!(
            "Verified {} pieces, {} present",
            statuses.len(),
            statuses
                .iter()
                .filter(|s| **s == PieceStatus::Present)
                .count()
        );

        Ok(statuses)
    }

    fn get(&self, index: u32) -> Result<Bytes, StorageError> {
        self.pieces
            .read()
            .get(index as usize)
            .ok_or(StorageError::InvalidPieceIndex(index))?
            .clone()
            .ok_or(StorageError::PieceNotFound(index))
    }

    fn put(&self, index: u32, data: Bytes) -> Result<(), StorageError> {
        let expected = self
            .layout
            .piece_len(index)
            .ok_or(StorageError::InvalidPieceIndex(index))?;

        if data.len() != expected as usize {
            return Err(StorageError::InvalidPieceLength {
                index,
                expected,
                actual: data.len(),
            });
        }

        self.pieces.write()[index as usize] = Some(data);
        Ok(())
    }
}
