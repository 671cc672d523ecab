//! Protocol constants and tuning defaults.
//!
//! Every timeout and threshold the engine uses lives here so the defaults of
//! [`Config`](crate::Config) have a single source.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &[u8; 8] = b"-BS0001-";

// ============================================================================
// Wire protocol
// ============================================================================

/// Protocol name sent in the handshake.
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";

/// Total handshake length: 1 + 19 + 8 + 20 + 20.
pub const HANDSHAKE_LEN: usize = 68;

/// Upper bound on any single length-prefixed frame.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum request length per BEP 3 (128KB). Requests larger than this are suspicious.
pub const MAX_REQUEST_LENGTH: u32 = 131072;

/// Initial capacity of the connection framing buffer.
pub const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Write timeout for a single batched write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Block and piece sizes
// ============================================================================

/// Standard block size (16KB)
pub const BLOCK_SIZE: u32 = 16384;

// ============================================================================
// Piece coordination
// ============================================================================

/// A checkout older than this is reclaimed by the sweep.
pub const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(120);

/// How often the checkout sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Fraction of relevant pieces present at which endgame starts.
pub const ENDGAME_THRESHOLD: f64 = 0.95;

/// Maximum concurrent checkouts of one piece while in endgame.
pub const ENDGAME_MAX_HOLDERS: u8 = 2;

// ============================================================================
// Peer session
// ============================================================================

/// Tick of the session worker loops.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Time spent choked before `Interested` is sent again.
pub const CHOKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive choke timeouts after which the peer is dropped.
pub const MAX_CHOKE_TIMEOUTS: u32 = 10;

/// Silence window after which a connection is presumed dead.
pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Capacity of each per-session mailbox.
pub const MAILBOX_CAPACITY: usize = 1024;

/// Maximum messages concatenated into one socket write.
pub const MAX_WRITE_BATCH: usize = 64;
