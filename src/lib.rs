//! bitswarm - A BitTorrent piece exchange engine
//!
//! This library implements the peer side of a BitTorrent transfer: the wire
//! protocol, per-connection sessions, block assembly with hash verification,
//! and the coordinator that decides which peer downloads which piece.
//!
//! # Modules
//!
//! - [`peer`] - Wire codec, connection pump and peer sessions
//! - [`piece`] - Piece assembly and the cross-peer piece coordinator
//! - [`transfer`] - Owner of the sessions and the coordinator of one transfer
//! - [`metainfo`] - Piece layout and piece digests
//! - [`storage`] - Persistence contract and an in-memory store
//! - [`bandwidth`] - Token bucket rate limiting
//! - [`config`] - Tunable timeouts and limits
//!
//! Discovering peers and parsing torrent files are left to the embedding
//! program. Log output goes through [`tracing`]; install a subscriber to see
//! it.

pub mod bandwidth;
pub mod config;
pub mod constants;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod storage;
pub mod transfer;

pub use bandwidth::{BandwidthLimiter, RateLimiter};
pub use config::{Config, PieceConfig, SessionConfig};
pub use metainfo::{MetainfoError, PieceHash, PieceLayout};
pub use peer::{
    Bitfield, ConnectionType, Handshake, Message, PeerError, PeerId, PeerSession, SessionEvent,
    SessionHandle, SessionKey,
};
pub use piece::{CompletedPiece, Piece, PieceError, PieceManager, PieceStatus};
pub use storage::{MemoryStorage, PieceStore, StorageError};
pub use transfer::{Transfer, TransferError, TransferStats};
