use thiserror::Error;

/// Errors raised by piece units and the piece manager.
#[derive(Debug, Error)]
pub enum PieceError {
    /// The piece index is outside the transfer.
    #[error("invalid piece index: {0}")]
    InvalidIndex(u32),

    /// A block offset is not a multiple of the block size.
    #[error("misaligned block offset: piece {index}, offset {offset}")]
    MisalignedOffset { index: u32, offset: u32 },

    /// A block offset lies past the end of the piece.
    #[error("block offset out of range: piece {index}, offset {offset}")]
    OffsetOutOfRange { index: u32, offset: u32 },

    /// A block does not have the length its offset implies.
    #[error("invalid block length: piece {index}, offset {offset}, expected {expected}, got {actual}")]
    InvalidBlockLength {
        index: u32,
        offset: u32,
        expected: u32,
        actual: usize,
    },

    /// The configured block size is zero.
    #[error("block size must be positive")]
    InvalidBlockSize,

    /// The status table handed to the manager does not cover every piece.
    #[error("expected {expected} piece statuses, got {actual}")]
    StatusCountMismatch { expected: usize, actual: usize },

    /// The manager has been disposed.
    #[error("piece manager disposed")]
    Disposed,
}
