//! Peer wire protocol and sessions.
//!
//! This module holds the message codec, the connection pump that frames a
//! byte stream into messages, and [`PeerSession`], which runs the
//! handshake, choke and request exchange with one remote peer.

mod bitfield;
mod block;
mod error;
mod message;
mod peer_id;
mod pump;
mod roles;
mod session;
mod state;

pub use bitfield::Bitfield;
pub use block::{compute_block_count, compute_block_length, Block, BlockRequest};
pub use error::{ErrorKind, PeerError};
pub use message::{Decoded, Handshake, Message, MessageId};
pub use peer_id::PeerId;
pub use pump::{split_stream, FrameDecoder, PumpReader, PumpWriter};
pub use session::{
    ConnectionType, PeerSession, SessionEvent, SessionHandle, SessionKey, SessionParams,
};
pub use state::{HandshakeState, LeechingState, PeerStats, SeedingState, SessionSnapshot};
