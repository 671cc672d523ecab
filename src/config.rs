//! Engine configuration.
//!
//! All values default to the constants in [`crate::constants`].
//!
//! # Examples
//!
//! ```
//! use bitswarm::{Config, PieceConfig};
//! use std::time::Duration;
//!
//! let config = Config::default()
//!     .with_pieces(PieceConfig::default().with_checkout_timeout(Duration::from_secs(30)))
//!     .with_download_limit(1_000_000);
//!
//! assert_eq!(config.pieces.checkout_timeout, Duration::from_secs(30));
//! ```

use std::time::Duration;

use crate::constants::{
    BLOCK_SIZE, CHECKOUT_TIMEOUT, CHOKE_TIMEOUT, ENDGAME_MAX_HOLDERS, ENDGAME_THRESHOLD,
    KEEP_ALIVE_TIMEOUT, MAILBOX_CAPACITY, MAX_CHOKE_TIMEOUTS, MAX_WRITE_BATCH, POLL_INTERVAL,
    SWEEP_INTERVAL,
};

/// Settings for the piece coordinator and piece units.
#[derive(Debug, Clone, PartialEq)]
pub struct PieceConfig {
    /// Size of a requested block in bytes.
    pub block_size: u32,
    /// Age after which a checkout is reclaimed.
    pub checkout_timeout: Duration,
    /// Period of the reclaim sweep.
    pub sweep_interval: Duration,
    /// Completed fraction at which endgame starts.
    pub endgame_threshold: f64,
    /// Maximum concurrent checkouts of a single piece in endgame.
    pub endgame_max_holders: u8,
}

impl Default for PieceConfig {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            checkout_timeout: CHECKOUT_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
            endgame_threshold: ENDGAME_THRESHOLD,
            endgame_max_holders: ENDGAME_MAX_HOLDERS,
        }
    }
}

impl PieceConfig {
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_endgame_threshold(mut self, threshold: f64) -> Self {
        self.endgame_threshold = threshold;
        self
    }
}

/// Settings for a single peer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Tick of the worker loops.
    pub poll_interval: Duration,
    /// Time spent choked before re-sending `Interested`.
    pub choke_timeout: Duration,
    /// Consecutive choke timeouts tolerated before giving up on the peer.
    pub max_choke_timeouts: u32,
    /// Silence window after which the connection is considered dead.
    pub keep_alive_timeout: Duration,
    /// Capacity of each mailbox.
    pub mailbox_capacity: usize,
    /// Maximum number of messages written in one batch.
    pub max_batch: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            choke_timeout: CHOKE_TIMEOUT,
            max_choke_timeouts: MAX_CHOKE_TIMEOUTS,
            keep_alive_timeout: KEEP_ALIVE_TIMEOUT,
            mailbox_capacity: MAILBOX_CAPACITY,
            max_batch: MAX_WRITE_BATCH,
        }
    }
}

impl SessionConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_choke_timeout(mut self, timeout: Duration, max_timeouts: u32) -> Self {
        self.choke_timeout = timeout;
        self.max_choke_timeouts = max_timeouts;
        self
    }

    pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }
}

/// Top-level configuration of a transfer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    pub pieces: PieceConfig,
    pub session: SessionConfig,
    /// Download ceiling in bytes per second, 0 for unlimited.
    pub download_limit: u64,
    /// Upload ceiling in bytes per second, 0 for unlimited.
    pub upload_limit: u64,
}

impl Config {
    pub fn with_pieces(mut self, pieces: PieceConfig) -> Self {
        self.pieces = pieces;
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_download_limit(mut self, bytes_per_sec: u64) -> Self {
        self.download_limit = bytes_per_sec;
        self
    }

    pub fn with_upload_limit(mut self, bytes_per_sec: u64) -> Self {
        self.upload_limit = bytes_per_sec;
        self
    }
}
