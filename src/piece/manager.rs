use super::error::PieceError;
use super::status::PieceStatus;
use super::unit::Piece;
use crate::config::PieceConfig;
use crate::metainfo::PieceLayout;
use crate::peer::Bitfield;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// A verified piece ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPiece {
    pub index: u32,
    pub data: Bytes,
}

/// An outstanding lease on a piece.
#[derive(Debug, Clone, Copy)]
struct Checkout {
    since: Instant,
    holders: u8,
}

struct Inner {
    status: Vec<PieceStatus>,
    checkouts: HashMap<u32, Checkout>,
    present: usize,
    relevant: usize,
    disposed: bool,
}

impl Inner {
    fn status_of(&self, index: u32) -> Result<PieceStatus, PieceError> {
        if self.disposed {
            return Err(PieceError::Disposed);
        }
        self.status
            .get(index as usize)
            .copied()
            .ok_or(PieceError::InvalidIndex(index))
    }

    fn completed_ratio(&self) -> f64 {
        if self.relevant == 0 {
            1.0
        } else {
            self.present as f64 / self.relevant as f64
        }
    }
}

/// Shared owner of the per-piece status table of one transfer.
///
/// Every peer session of the transfer goes through the manager to decide
/// what to download. All state sits behind a single lock, so concurrent
/// checkouts and completions from different sessions are linearizable.
///
/// Completed pieces are queued on the channel returned by [`PieceManager::new`]
/// rather than delivered through callbacks.
///
/// # Examples
///
/// ```
/// use bitswarm::metainfo::{PieceHash, PieceLayout};
/// use bitswarm::{PieceConfig, PieceManager, PieceStatus};
/// use std::sync::Arc;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let layout = Arc::new(PieceLayout::new(32, 16, vec![PieceHash::of(&[0; 16]); 2])?);
/// let (manager, _completed) =
///     PieceManager::new(layout, vec![PieceStatus::Missing; 2], PieceConfig::default())?;
///
/// let piece = manager.check_out(0)?.expect("piece 0 is missing");
/// assert_eq!(piece.index(), 0);
///
/// // Outside endgame a checked out piece is not handed out twice.
/// assert!(manager.check_out(0)?.is_none());
/// # Ok(())
/// # }
/// ```
pub struct PieceManager {
    layout: Arc<PieceLayout>,
    config: PieceConfig,
    inner: Mutex<Inner>,
    sweeping: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    completed_tx: mpsc::UnboundedSender<CompletedPiece>,
}

impl PieceManager {
    /// Creates a manager from the statuses reported by storage verification.
    ///
    /// `CheckedOut` entries are treated as `Missing`; no lease survives a
    /// restart.
    pub fn new(
        layout: Arc<PieceLayout>,
        statuses: Vec<PieceStatus>,
        config: PieceConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<CompletedPiece>), PieceError> {
        if config.block_size == 0 {
            return Err(PieceError::InvalidBlockSize);
        }
        if statuses.len() != layout.piece_count() {
            return Err(PieceError::StatusCountMismatch {
                expected: layout.piece_count(),
                actual: statuses.len(),
            });
        }

        let status: Vec<PieceStatus> = statuses
            .into_iter()
            .map(|s| match s {
                PieceStatus::CheckedOut => PieceStatus::Missing,
                other => other,
            })
            .collect();
        let present = status.iter().filter(|s| **s == PieceStatus::Present).count();
        let relevant = status.iter().filter(|s| s.is_relevant()).count();

        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            layout,
            config,
            inner: Mutex::new(Inner {
                status,
                checkouts: HashMap::new(),
                present,
                relevant,
                disposed: false,
            }),
            sweeping: AtomicBool::new(false),
            sweeper: Mutex::new(None),
            completed_tx,
        });

        Ok((manager, completed_rx))
    }

    pub fn layout(&self) -> &Arc<PieceLayout> {
        &self.layout
    }

    pub fn config(&self) -> &PieceConfig {
        &self.config
    }

    pub fn piece_count(&self) -> usize {
        self.layout.piece_count()
    }

    pub fn status(&self, index: u32) -> Result<PieceStatus, PieceError> {
        self.inner.lock().status_of(index)
    }

    /// Leases the piece at `index` to the caller.
    ///
    /// A `Missing` piece is always granted. A `CheckedOut` piece is granted
    /// again only in endgame and only while fewer than
    /// `endgame_max_holders` leases are outstanding. Anything else yields
    /// `None`.
    pub fn check_out(&self, index: u32) -> Result<Option<Piece>, PieceError> {
        let mut inner = self.inner.lock();
        let status = inner.status_of(index)?;
        let endgame = inner.completed_ratio() >= self.config.endgame_threshold;
        let now = Instant::now();

        match status {
            PieceStatus::Missing => {
                inner.status[index as usize] = PieceStatus::CheckedOut;
                inner.checkouts.insert(
                    index,
                    Checkout {
                        since: now,
                        holders: 1,
                    },
                );
            }
            PieceStatus::CheckedOut if endgame => {
                let max_holders = self.config.endgame_max_holders;
                let checkout = inner.checkouts.entry(index).or_insert(Checkout {
                    since: now,
                    holders: 0,
                });
                if checkout.holders >= max_holders {
                    return Ok(None);
                }
                checkout.holders += 1;
                checkout.since = now;
                debug!("Endgame duplicate checkout of piece {}", index);
            }
            _ => return Ok(None),
        }
        drop(inner);

        let (length, hash) = match (self.layout.piece_len(index), self.layout.hash(index)) {
            (Some(length), Some(hash)) => (length, *hash),
            _ => return Err(PieceError::InvalidIndex(index)),
        };

        debug!("Checked out piece {}", index);
        Ok(Some(Piece::new(index, hash, length, self.config.block_size)))
    }

    /// Records a verified piece.
    ///
    /// Only a `Missing` or `CheckedOut` piece transitions, so the second
    /// finisher of an endgame race is ignored. Returns true if this call
    /// made the piece present.
    pub fn on_piece_completed(&self, index: u32, data: Bytes) -> Result<bool, PieceError> {
        let mut inner = self.inner.lock();
        match inner.status_of(index)? {
            PieceStatus::Missing | PieceStatus::CheckedOut => {}
            _ => return Ok(false),
        }

        inner.status[index as usize] = PieceStatus::Present;
        inner.checkouts.remove(&index);
        inner.present += 1;
        let ratio = inner.completed_ratio();
        drop(inner);

        debug!(
            "Piece {} completed, {:.1}% done",
            index,
            ratio * 100.0
        );
        let _ = self.completed_tx.send(CompletedPiece { index, data });
        Ok(true)
    }

    /// Returns a `Present` piece to `Missing`, for when it could not be
    /// persisted. Returns false if the piece was not present.
    pub fn revoke(&self, index: u32) -> Result<bool, PieceError> {
        let mut inner = self.inner.lock();
        if inner.status_of(index)? != PieceStatus::Present {
            return Ok(false);
        }
        inner.status[index as usize] = PieceStatus::Missing;
        inner.present -= 1;
        drop(inner);

        debug!("Piece {} revoked", index);
        Ok(true)
    }

    /// Fraction of relevant pieces that are present.
    pub fn completed_ratio(&self) -> f64 {
        self.inner.lock().completed_ratio()
    }

    pub fn present_count(&self) -> usize {
        self.inner.lock().present
    }

    /// True once every relevant piece is present.
    pub fn is_complete(&self) -> bool {
        let inner = self.inner.lock();
        inner.present == inner.relevant
    }

    pub fn is_endgame(&self) -> bool {
        self.completed_ratio() >= self.config.endgame_threshold
    }

    /// Indices currently leased, in ascending order.
    pub fn checked_out(&self) -> Vec<u32> {
        let inner = self.inner.lock();
        let mut indices: Vec<u32> = inner.checkouts.keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Bitfield of the pieces we can serve.
    pub fn present_bitfield(&self) -> Bitfield {
        let inner = self.inner.lock();
        let mut bitfield = Bitfield::new(inner.status.len());
        for (index, status) in inner.status.iter().enumerate() {
            if *status == PieceStatus::Present {
                bitfield.set_piece(index);
            }
        }
        bitfield
    }

    /// Returns every lease older than the checkout timeout to `Missing`.
    pub fn sweep(&self) -> Vec<u32> {
        self.sweep_expired(Instant::now())
    }

    /// Like [`sweep`](Self::sweep), measuring lease age against `now`.
    ///
    /// Returns the reclaimed indices. A sweep that starts while another is
    /// running returns immediately without reclaiming anything.
    pub fn sweep_expired(&self, now: Instant) -> Vec<u32> {
        if self.sweeping.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }

        let mut reclaimed = Vec::new();
        {
            let mut inner = self.inner.lock();
            if !inner.disposed {
                let timeout = self.config.checkout_timeout;
                inner.checkouts.retain(|index, checkout| {
                    let expired = now.saturating_duration_since(checkout.since) > timeout;
                    if expired {
                        reclaimed.push(*index);
                    }
                    !expired
                });
                for index in &reclaimed {
                    inner.status[*index as usize] = PieceStatus::Missing;
                }
            }
        }

        self.sweeping.store(false, Ordering::Release);

        if !reclaimed.is_empty() {
            reclaimed.sort_unstable();
            info!("Reclaimed {} timed out checkouts", reclaimed.len());
        }
        reclaimed
    }

    /// Spawns the periodic sweep on the current runtime.
    ///
    /// The task holds only a weak reference and stops on its own once the
    /// manager is dropped or disposed.
    pub fn start_sweeper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.config.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if manager.is_disposed() {
                    break;
                }
                manager.sweep();
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// Stops the sweep. Every later operation fails with
    /// [`PieceError::Disposed`].
    pub fn dispose(&self) {
        self.inner.lock().disposed = true;
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for PieceManager {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}
