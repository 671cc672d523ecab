//! Piece persistence.
//!
//! The engine does not write files itself. It talks to a [`PieceStore`],
//! which maps whole pieces onto whatever backing the embedder provides.
//! [`MemoryStorage`] keeps pieces in memory and is what the tests use.
//!
//! # Examples
//!
//! ```
//! use bitswarm::metainfo::{PieceHash, PieceLayout};
//! use bitswarm::storage::{MemoryStorage, PieceStore};
//! use bitswarm::PieceStatus;
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let piece = vec![3u8; 64];
//! let layout = Arc::new(PieceLayout::new(64, 64, vec![PieceHash::of(&piece)])?);
//!
//! let storage = MemoryStorage::new(layout);
//! assert_eq!(storage.verify()?, vec![PieceStatus::Missing]);
//!
//! storage.put(0, Bytes::from(piece))?;
//! assert_eq!(storage.verify()?, vec![PieceStatus::Present]);
//! # Ok(())
//! # }
//! ```

mod error;
mod memory;

pub use error::StorageError;
pub use memory::MemoryStorage;

use crate::piece::PieceStatus;
use bytes::Bytes;

/// Backing store for verified pieces.
///
/// Implementations are called from session tasks and must be cheap enough to
/// run inline; a disk-backed store should hand the work to a blocking pool.
pub trait PieceStore: Send + Sync {
    /// Checks what is already stored, one status per piece. Pieces that
    /// overlap files the caller does not want come back as
    /// [`PieceStatus::Ignore`] or [`PieceStatus::Partial`].
    fn verify(&self) -> Result<Vec<PieceStatus>, StorageError>;

    /// Reads a whole piece.
    fn get(&self, index: u32) -> Result<Bytes, StorageError>;

    /// Writes a whole, already verified piece.
    fn put(&self, index: u32, data: Bytes) -> Result<(), StorageError>;
}
