//! Transfer throttling using a token bucket.
//!
//! The connection pump reports every read and write to a shared
//! [`BandwidthLimiter`]. When a direction is over its ceiling the reporting
//! task sleeps until the bucket has refilled.
//!
//! # Example
//!
//! ```
//! use bitswarm::BandwidthLimiter;
//!
//! # async fn example() {
//! // 1MB/s download, 500KB/s upload
//! let limiter = BandwidthLimiter::new(1_000_000, 500_000);
//!
//! limiter.on_bytes_read(16384).await;
//! limiter.on_bytes_written(16384).await;
//!
//! let unlimited = BandwidthLimiter::unlimited();
//! assert!(unlimited.is_unlimited());
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A token bucket rate limiter for one direction of traffic.
///
/// The bucket holds up to two seconds worth of tokens so short bursts pass
/// without sleeping.
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    tokens_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        self.tokens = (self.tokens + elapsed * self.tokens_per_sec).min(self.max_tokens);
    }
}

impl RateLimiter {
    /// Creates a limiter allowing `bytes_per_sec`. Zero means unlimited.
    pub fn new(bytes_per_sec: u64) -> Arc<Self> {
        let (tokens_per_sec, max_tokens) = if bytes_per_sec == 0 {
            (f64::INFINITY, f64::INFINITY)
        } else {
            (bytes_per_sec as f64, (bytes_per_sec * 2) as f64)
        };
        Arc::new(Self {
            bucket: Mutex::new(TokenBucket {
                tokens: max_tokens,
                max_tokens,
                tokens_per_sec,
                last_update: Instant::now(),
            }),
        })
    }

    pub fn is_unlimited(&self) -> bool {
        self.bucket.lock().tokens_per_sec.is_infinite()
    }

    /// Takes `bytes` tokens and returns how long the caller has to wait for
    /// the debt to be repaid. The lock is released before any sleeping.
    pub fn consume(&self, bytes: usize) -> Duration {
        let mut bucket = self.bucket.lock();
        if bucket.tokens_per_sec.is_infinite() {
            return Duration::ZERO;
        }
        bucket.refill(Instant::now());

        let bytes = bytes as f64;
        bucket.tokens -= bytes;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / bucket.tokens_per_sec)
        }
    }

    /// Returns the currently available tokens (bytes).
    pub fn available(&self) -> usize {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.tokens.max(0.0) as usize
    }
}

/// Download and upload throttling shared by every connection of a transfer.
pub struct BandwidthLimiter {
    download: Arc<RateLimiter>,
    upload: Arc<RateLimiter>,
}

impl BandwidthLimiter {
    /// Creates a limiter with the given ceilings. A limit of 0 means unlimited.
    pub fn new(download_limit: u64, upload_limit: u64) -> Self {
        Self {
            download: RateLimiter::new(download_limit),
            upload: RateLimiter::new(upload_limit),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.download.is_unlimited() && self.upload.is_unlimited()
    }

    /// Accounts for `bytes` read from a peer, sleeping if over the ceiling.
    pub async fn on_bytes_read(&self, bytes: usize) {
        let wait = self.download.consume(bytes);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Accounts for `bytes` about to be written to a peer, sleeping if over
    /// the ceiling.
    pub async fn on_bytes_written(&self, bytes: usize) {
        let wait = self.upload.consume(bytes);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    pub fn download_limiter(&self) -> Arc<RateLimiter> {
        self.download.clone()
    }

    pub fn upload_limiter(&self) -> Arc<RateLimiter> {
        self.upload.clone()
    }
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}
