//! The owner of one transfer.
//!
//! A [`Transfer`] ties the piece coordinator, the piece store and any number
//! of peer sessions together. It persists pieces as they complete, tells
//! every connected peer about them, and keeps the byte totals of sessions
//! that have gone away.
//!
//! # Examples
//!
//! ```no_run
//! use bitswarm::metainfo::PieceLayout;
//! use bitswarm::peer::PeerId;
//! use bitswarm::storage::MemoryStorage;
//! use bitswarm::{Config, Transfer};
//! use std::sync::Arc;
//!
//! # async fn example(info_hash: [u8; 20], layout: Arc<PieceLayout>) -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStorage::new(layout.clone()));
//! let transfer = Transfer::new(info_hash, PeerId::generate(), layout, store, Config::default())?;
//!
//! transfer.connect("192.168.1.100:6881".parse()?).await?;
//! transfer.wait_complete().await;
//!
//! let totals = transfer.totals();
//! println!("downloaded {} bytes", totals.downloaded);
//! transfer.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod error;

pub use error::TransferError;

use crate::bandwidth::BandwidthLimiter;
use crate::config::Config;
use crate::metainfo::PieceLayout;
use crate::peer::{
    ConnectionType, PeerId, PeerSession, PeerStats, SessionEvent, SessionHandle, SessionKey,
    SessionParams,
};
use crate::piece::{CompletedPiece, PieceManager};
use crate::storage::PieceStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Byte totals of a transfer. Only piece payload is counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub downloaded: u64,
    pub uploaded: u64,
}

impl TransferStats {
    fn add(&mut self, stats: &PeerStats) {
        self.downloaded += stats.downloaded;
        self.uploaded += stats.uploaded;
    }
}

struct Peers {
    sessions: HashMap<SessionKey, Arc<SessionHandle>>,
    /// Counters of sessions that have been removed.
    folded: TransferStats,
}

impl Peers {
    /// Removes a session and folds its counters. Returns false if someone
    /// else removed it first.
    fn remove(&mut self, key: SessionKey, stats: &PeerStats) -> bool {
        if self.sessions.remove(&key).is_none() {
            return false;
        }
        self.folded.add(stats);
        true
    }
}

struct Inner {
    store: Arc<dyn PieceStore>,
    manager: Arc<PieceManager>,
    peers: Mutex<Peers>,
    complete: watch::Sender<bool>,
}

impl Inner {
    fn on_completed(&self, piece: CompletedPiece) {
        let CompletedPiece { index, data } = piece;
        if let Err(e) = self.store.put(index, data) {
            error!("Failed to store piece {}: {}", index, e);
            // Download it again rather than count it as done.
            if let Err(e) = self.manager.revoke(index) {
                debug!("Piece {} not revoked: {}", index, e);
            }
            return;
        }

        let sessions: Vec<Arc<SessionHandle>> =
            self.peers.lock().sessions.values().cloned().collect();
        for session in sessions {
            if !session.announce_have(index) {
                debug!("{}: have {} not sent", session.key(), index);
            }
        }

        if self.manager.is_complete() && !*self.complete.borrow() {
            info!("Transfer complete");
            self.complete.send_replace(true);
        }
    }

    fn on_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::Error { key, error, fatal } => {
                if fatal {
                    debug!("{}: session failed: {}", key, error);
                }
            }
            SessionEvent::PieceCorrupted { key, index } => {
                warn!("{}: piece {} failed hash verification", key, index);
            }
            SessionEvent::Closed { key, .. } => {
                let session = self.peers.lock().sessions.get(&key).cloned();
                if let Some(session) = session {
                    tokio::spawn(reap(self.clone(), session));
                }
            }
        }
    }
}

/// Waits for a closed session's tasks to exit, then removes it and folds its
/// final counters.
async fn reap(inner: Arc<Inner>, session: Arc<SessionHandle>) {
    session.join().await;
    let key = session.key();
    let stats = session.stats();
    if inner.peers.lock().remove(key, &stats) {
        debug!(
            "{}: removed, {} bytes down, {} bytes up",
            key, stats.downloaded, stats.uploaded
        );
    }
}

/// A transfer: one piece layout shared by many peer sessions.
pub struct Transfer {
    info_hash: [u8; 20],
    local_id: PeerId,
    layout: Arc<PieceLayout>,
    config: Config,
    limiter: Arc<BandwidthLimiter>,
    inner: Arc<Inner>,
    events: mpsc::UnboundedSender<SessionEvent>,
    next_key: AtomicU64,
    shut_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Transfer {
    /// Verifies `store`, builds the piece coordinator and starts the
    /// background tasks. Must be called from within a tokio runtime.
    pub fn new(
        info_hash: [u8; 20],
        local_id: PeerId,
        layout: Arc<PieceLayout>,
        store: Arc<dyn PieceStore>,
        config: Config,
    ) -> Result<Self, TransferError> {
        let statuses = store.verify()?;
        let (manager, completed_rx) =
            PieceManager::new(layout.clone(), statuses, config.pieces.clone())?;
        manager.start_sweeper();

        let (complete, _) = watch::channel(manager.is_complete());
        let (events, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            "Starting transfer: {} pieces, {} present",
            layout.piece_count(),
            manager.present_count()
        );

        let inner = Arc::new(Inner {
            store,
            manager,
            peers: Mutex::new(Peers {
                sessions: HashMap::new(),
                folded: TransferStats::default(),
            }),
            complete,
        });

        let driver = tokio::spawn(drive(inner.clone(), completed_rx, events_rx, shutdown_rx));
        let limiter = Arc::new(BandwidthLimiter::new(
            config.download_limit,
            config.upload_limit,
        ));

        Ok(Self {
            info_hash,
            local_id,
            layout,
            config,
            limiter,
            inner,
            events,
            next_key: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
            shutdown_tx,
            driver: Mutex::new(Some(driver)),
        })
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn layout(&self) -> &Arc<PieceLayout> {
        &self.layout
    }

    pub fn manager(&self) -> &Arc<PieceManager> {
        &self.inner.manager
    }

    /// Starts a session over an already connected stream.
    pub async fn add_peer<S>(
        &self,
        stream: S,
        connection_type: ConnectionType,
    ) -> Result<SessionKey, TransferError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TransferError::ShutDown);
        }

        let key = SessionKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        let handle = PeerSession::start(
            stream,
            SessionParams {
                key,
                connection_type,
                info_hash: self.info_hash,
                local_id: self.local_id,
                manager: self.inner.manager.clone(),
                store: self.inner.store.clone(),
                limiter: self.limiter.clone(),
                config: self.config.session.clone(),
                events: self.events.clone(),
            },
        )
        .await?;
        let handle = Arc::new(handle);

        self.inner.peers.lock().sessions.insert(key, handle.clone());
        // The session may have closed before it was registered, in which
        // case the driver found nothing to reap.
        if handle.is_closed() {
            tokio::spawn(reap(self.inner.clone(), handle.clone()));
        }

        debug!("{}: added {:?} peer", key, connection_type);
        Ok(key)
    }

    /// Dials `addr` and starts an outgoing session.
    pub async fn connect(&self, addr: SocketAddr) -> Result<SessionKey, TransferError> {
        let stream = TcpStream::connect(addr).await?;
        self.add_peer(stream, ConnectionType::Outgoing).await
    }

    /// Starts an incoming session on a stream accepted by the caller.
    pub async fn accept(&self, stream: TcpStream) -> Result<SessionKey, TransferError> {
        if let Ok(addr) = stream.peer_addr() {
            debug!("Accepted connection from {}", addr);
        }
        self.add_peer(stream, ConnectionType::Incoming).await
    }

    /// Byte totals of every session, closed or still running.
    pub fn totals(&self) -> TransferStats {
        let peers = self.inner.peers.lock();
        let mut totals = peers.folded;
        for session in peers.sessions.values() {
            totals.add(&session.stats());
        }
        totals
    }

    /// Current counters of each running session.
    pub fn peer_stats(&self) -> Vec<(SessionKey, PeerStats)> {
        let peers = self.inner.peers.lock();
        let mut stats: Vec<_> = peers
            .sessions
            .iter()
            .map(|(key, session)| (*key, session.stats()))
            .collect();
        stats.sort_unstable_by_key(|(key, _)| *key);
        stats
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().sessions.len()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.manager.is_complete()
    }

    /// Resolves once every relevant piece has been stored.
    pub async fn wait_complete(&self) {
        let mut complete = self.inner.complete.subscribe();
        let _ = complete.wait_for(|done| *done).await;
    }

    /// Closes every session, folds their counters, stops the coordinator
    /// and waits for the background tasks.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let sessions: Vec<Arc<SessionHandle>> = {
            let peers = self.inner.peers.lock();
            peers.sessions.values().cloned().collect()
        };
        for session in &sessions {
            session.dispose();
        }
        for session in &sessions {
            session.join().await;
            self.inner
                .peers
                .lock()
                .remove(session.key(), &session.stats());
        }

        self.shutdown_tx.send_replace(true);
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }
        self.inner.manager.dispose();

        let totals = self.totals();
        info!(
            "Transfer shut down: {} bytes down, {} bytes up",
            totals.downloaded, totals.uploaded
        );
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        for session in self.inner.peers.lock().sessions.values() {
            session.dispose();
        }
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
        self.inner.manager.dispose();
    }
}

/// Persists completed pieces and handles session events until shutdown.
async fn drive(
    inner: Arc<Inner>,
    mut completed: mpsc::UnboundedReceiver<CompletedPiece>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            Some(piece) = completed.recv() => inner.on_completed(piece),
            Some(event) = events.recv() => inner.on_event(event),
            _ = shutdown.changed() => break,
        }
    }

    while let Ok(piece) = completed.try_recv() {
        inner.on_completed(piece);
    }
    while let Ok(event) = events.try_recv() {
        inner.on_event(event);
    }
}

#[cfg(test)]
mod tests;
