use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("piece {index} has length {actual}, expected {expected}")]
    InvalidPieceLength {
        index: u32,
        expected: u32,
        actual: usize,
    },

    #[error("piece not stored: {0}")]
    PieceNotFound(u32),
}
