use crate::piece::PieceError;
use crate::storage::StorageError;
use thiserror::Error;

/// Broad class of a [`PeerError`], deciding whether the session survives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A message arrived in a state that does not allow it. Fatal.
    ProtocolSequence,
    /// A well-framed message carried an invalid field. The message is dropped.
    MalformedPayload,
    /// The stream closed or broke. Fatal.
    Io,
    /// A piece failed verification. The piece is dropped.
    Integrity,
    /// The peer went silent or never unchoked us. Fatal.
    Timeout,
}

/// Errors that can occur during peer communication.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer sent an invalid handshake.
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),

    /// The peer's info hash doesn't match ours.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// The peer announced our own peer id.
    #[error("connected to self")]
    SelfConnection,

    /// A message arrived before the handshake completed, or a second
    /// handshake arrived.
    #[error("protocol sequence error: {0}")]
    ProtocolSequence(String),

    /// Received a malformed protocol message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Received an unknown message ID.
    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    /// A valid message that the current choke or interest state forbids.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// A downloaded piece did not match its digest.
    #[error("piece {0} failed hash verification")]
    CorruptPiece(u32),

    /// Nothing was sent or received within the keep-alive window.
    #[error("timeout")]
    Timeout,

    /// The peer kept us choked through too many choke timeouts.
    #[error("choked for {0} consecutive timeouts")]
    ChokeTimeout(u32),

    /// Piece bookkeeping rejected an operation.
    #[error("piece error: {0}")]
    Piece(#[from] PieceError),

    /// Storage could not serve a request.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl PeerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PeerError::Io(_) | PeerError::ConnectionClosed => ErrorKind::Io,
            PeerError::InvalidHandshake(_)
            | PeerError::InfoHashMismatch
            | PeerError::SelfConnection
            | PeerError::ProtocolSequence(_) => ErrorKind::ProtocolSequence,
            PeerError::InvalidMessage(_)
            | PeerError::InvalidMessageId(_)
            | PeerError::UnexpectedMessage(_)
            | PeerError::Storage(_) => ErrorKind::MalformedPayload,
            PeerError::CorruptPiece(_) => ErrorKind::Integrity,
            PeerError::Timeout | PeerError::ChokeTimeout(_) => ErrorKind::Timeout,
            PeerError::Piece(PieceError::Disposed) => ErrorKind::Io,
            PeerError::Piece(_) => ErrorKind::MalformedPayload,
        }
    }

    /// Returns true if the session has to be torn down.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::MalformedPayload | ErrorKind::Integrity
        )
    }
}
