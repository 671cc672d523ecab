use crate::peer::PeerError;
use crate::piece::PieceError;
use crate::storage::StorageError;
use thiserror::Error;

/// Errors raised by a [`Transfer`](super::Transfer).
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("piece error: {0}")]
    Piece(#[from] PieceError),

    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The transfer was shut down.
    #[error("transfer is shut down")]
    ShutDown,
}
