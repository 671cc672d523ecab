use thiserror::Error;

/// Errors that can occur when building a piece layout.
#[derive(Debug, Error)]
pub enum MetainfoError {
    /// The concatenated hash list is not a whole number of 20-byte digests.
    #[error("piece hash list length {0} is not a multiple of 20")]
    InvalidHashList(usize),

    /// The number of hashes does not match the number of pieces.
    #[error("expected {expected} piece hashes, got {actual}")]
    PieceCountMismatch { expected: usize, actual: usize },

    /// The piece length is zero.
    #[error("invalid piece length: {0}")]
    InvalidPieceLength(u32),

    /// A hex digest has the wrong length or contains non-hex characters.
    #[error("invalid hex digest: {0}")]
    InvalidHex(String),
}
