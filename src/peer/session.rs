use super::bitfield::Bitfield;
use super::block::{Block, BlockRequest};
use super::error::PeerError;
use super::message::{Handshake, Message};
use super::peer_id::PeerId;
use super::pump::split_stream;
use super::roles;
use super::state::{HandshakeState, LeechingState, PeerStats, SeedingState, SessionSnapshot};
use crate::bandwidth::BandwidthLimiter;
use crate::config::SessionConfig;
use crate::constants::MAX_REQUEST_LENGTH;
use crate::piece::PieceManager;
use crate::storage::PieceStore;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Identifies a session within its transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(pub u64);

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// We dialed; our handshake goes out first.
    Outgoing,
    /// The peer dialed; we answer its handshake.
    Incoming,
}

/// Notifications a session raises for its owner.
#[derive(Debug)]
pub enum SessionEvent {
    /// A communication error. Fatal errors are always followed by `Closed`.
    Error {
        key: SessionKey,
        error: PeerError,
        fatal: bool,
    },
    /// A piece downloaded from this session failed verification.
    PieceCorrupted { key: SessionKey, index: u32 },
    /// The session stopped. Raised exactly once. `stats` are the counters
    /// at the moment of closing; tasks still winding down may add to them,
    /// and [`SessionHandle::stats`] after [`SessionHandle::join`] is final.
    Closed { key: SessionKey, stats: PeerStats },
}

/// Everything a session needs from its transfer.
#[derive(Clone)]
pub struct SessionParams {
    pub key: SessionKey,
    pub connection_type: ConnectionType,
    pub info_hash: [u8; 20],
    pub local_id: PeerId,
    pub manager: Arc<PieceManager>,
    pub store: Arc<dyn PieceStore>,
    pub limiter: Arc<BandwidthLimiter>,
    pub config: SessionConfig,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

/// Mail for the download role.
#[derive(Debug)]
pub(super) enum DownloadMail {
    Choked,
    Unchoked,
    Block(Block),
}

/// Mail for the upload role.
#[derive(Debug)]
pub(super) enum UploadMail {
    Request(BlockRequest),
    Cancel(BlockRequest),
}

pub(super) struct ProtocolState {
    pub handshake: HandshakeState,
    pub seeding: SeedingState,
    pub leeching: LeechingState,
    pub remote_id: Option<PeerId>,
    pub remote_bitfield: Bitfield,
}

/// State shared by the tasks of one session.
pub(super) struct Shared {
    pub key: SessionKey,
    pub info_hash: [u8; 20],
    pub local_id: PeerId,
    pub manager: Arc<PieceManager>,
    pub store: Arc<dyn PieceStore>,
    pub config: SessionConfig,
    pub state: Mutex<ProtocolState>,
    pub downloaded: AtomicU64,
    pub uploaded: AtomicU64,
    started: Instant,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
    greeted: AtomicBool,
    shutdown: watch::Sender<bool>,
    events: mpsc::UnboundedSender<SessionEvent>,
    pub send_tx: mpsc::Sender<Message>,
    pub download_tx: mpsc::Sender<DownloadMail>,
    pub upload_tx: mpsc::Sender<UploadMail>,
}

impl Shared {
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True once the greeting is queued; `Have` may follow from then on.
    pub fn is_greeted(&self) -> bool {
        self.greeted.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn stats(&self) -> PeerStats {
        PeerStats::new(
            self.downloaded.load(Ordering::Relaxed),
            self.uploaded.load(Ordering::Relaxed),
            self.started.elapsed(),
        )
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            handshake: state.handshake,
            seeding: state.seeding,
            leeching: state.leeching,
            remote_id: state.remote_id,
            remote_pieces: state.remote_bitfield.count(),
        }
    }

    /// Puts `item` into a mailbox, giving up once the session closes.
    pub async fn enqueue<T>(&self, tx: &mpsc::Sender<T>, item: T) -> Result<(), PeerError> {
        let mut shutdown = self.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(PeerError::ConnectionClosed);
        }
        tokio::select! {
            sent = tx.send(item) => sent.map_err(|_| PeerError::ConnectionClosed),
            _ = shutdown.changed() => Err(PeerError::ConnectionClosed),
        }
    }

    pub fn raise(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Classifies an error from a role and tears the session down if it is
    /// fatal.
    pub fn handle_error(&self, error: PeerError) {
        if self.is_closed() {
            trace!("{}: error after close: {}", self.key, error);
            return;
        }

        let fatal = error.is_fatal();
        if fatal {
            warn!("{}: {}", self.key, error);
        } else {
            debug!("{}: dropped message: {}", self.key, error);
        }

        self.raise(SessionEvent::Error {
            key: self.key,
            error,
            fatal,
        });

        if fatal {
            self.close();
        }
    }

    /// Signals every role to stop and raises `Closed` once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
        debug!("{}: closed", self.key);
        self.raise(SessionEvent::Closed {
            key: self.key,
            stats: self.stats(),
        });
    }

    /// Queues bitfield, unchoke and interest, then opens the session to
    /// `Have` announcements.
    async fn greet(&self) -> Result<(), PeerError> {
        let bitfield = self.manager.present_bitfield();
        if !bitfield.is_empty() {
            self.enqueue(&self.send_tx, Message::Bitfield(bitfield.to_bytes()))
                .await?;
        }
        self.enqueue(&self.send_tx, Message::Unchoke).await?;
        self.enqueue(&self.send_tx, Message::Interested).await?;
        self.greeted.store(true, Ordering::Release);

        // Pieces completed after the bitfield snapshot were not announced.
        let missed: Vec<usize> = self
            .manager
            .present_bitfield()
            .pieces()
            .filter(|&index| !bitfield.has_piece(index))
            .collect();
        for index in missed {
            self.enqueue(&self.send_tx, Message::Have { piece: index as u32 })
                .await?;
        }
        Ok(())
    }

    /// Validates one inbound message against the session state and hands it
    /// to the role that owns it.
    pub async fn route(&self, message: Message) -> Result<(), PeerError> {
        let message = match message {
            Message::Handshake(handshake) => return self.on_handshake(handshake).await,
            other => other,
        };

        if !self.state.lock().handshake.is_complete() {
            return Err(PeerError::ProtocolSequence(format!(
                "{} before handshake",
                message_name(&message)
            )));
        }

        let layout = self.manager.layout();
        match message {
            Message::KeepAlive | Message::Port(_) => Ok(()),
            Message::Choke => {
                self.state.lock().seeding = SeedingState::Choked;
                self.enqueue(&self.download_tx, DownloadMail::Choked).await
            }
            Message::Unchoke => {
                self.state.lock().seeding = SeedingState::Unchoked;
                self.enqueue(&self.download_tx, DownloadMail::Unchoked).await
            }
            Message::Interested => {
                self.state.lock().leeching = LeechingState::Interested;
                Ok(())
            }
            Message::NotInterested => {
                self.state.lock().leeching = LeechingState::Uninterested;
                Ok(())
            }
            Message::Have { piece } => {
                if !layout.contains(piece) {
                    return Err(PeerError::InvalidMessage(format!(
                        "have for piece {} out of range",
                        piece
                    )));
                }
                self.state.lock().remote_bitfield.set_piece(piece as usize);
                Ok(())
            }
            Message::Bitfield(bytes) => {
                let bitfield = Bitfield::try_from_bytes(&bytes, layout.piece_count())?;
                self.state.lock().remote_bitfield = bitfield;
                Ok(())
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                if self.state.lock().leeching != LeechingState::Interested {
                    return Err(PeerError::UnexpectedMessage(
                        "request from uninterested peer".to_string(),
                    ));
                }
                let request = self.validate_request(index, begin, length)?;
                self.enqueue(&self.upload_tx, UploadMail::Request(request))
                    .await
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                let request = self.validate_request(index, begin, length)?;
                self.enqueue(&self.upload_tx, UploadMail::Cancel(request))
                    .await
            }
            Message::Piece { index, begin, data } => {
                let block_size = self.manager.config().block_size;
                match layout.block_len(index, begin, block_size) {
                    Some(expected) if expected as usize == data.len() => {}
                    _ => {
                        return Err(PeerError::InvalidMessage(format!(
                            "block {}+{} with {} bytes does not fit the layout",
                            index,
                            begin,
                            data.len()
                        )))
                    }
                }
                self.downloaded
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                self.enqueue(
                    &self.download_tx,
                    DownloadMail::Block(Block::new(index, begin, data)),
                )
                .await
            }
            // routed above
            Message::Handshake(_) => Ok(()),
        }
    }

    async fn on_handshake(&self, handshake: Handshake) -> Result<(), PeerError> {
        handshake.validate(&self.info_hash, self.local_id.as_bytes())?;

        let state = {
            let mut state = self.state.lock();
            state.handshake.on_received()?;
            state.remote_id = Some(PeerId(handshake.peer_id));
            state.handshake
        };
        debug!(
            "{}: handshake from {:?}, state {:?}",
            self.key,
            PeerId(handshake.peer_id),
            state
        );

        if state == HandshakeState::ReceivedNotSent {
            let reply = Handshake::new(self.info_hash, *self.local_id.as_bytes());
            self.enqueue(&self.send_tx, Message::Handshake(reply)).await?;
            // The send mailbox is FIFO, so once queued the reply precedes
            // everything else we write.
            self.state.lock().handshake.on_sent()?;
        }

        self.greet().await
    }

    fn validate_request(
        &self,
        index: u32,
        begin: u32,
        length: u32,
    ) -> Result<BlockRequest, PeerError> {
        let piece_len = self
            .manager
            .layout()
            .piece_len(index)
            .ok_or_else(|| {
                PeerError::InvalidMessage(format!("request for piece {} out of range", index))
            })?;

        if length == 0 || length > MAX_REQUEST_LENGTH {
            return Err(PeerError::InvalidMessage(format!(
                "request length {} out of bounds",
                length
            )));
        }
        if begin as u64 + length as u64 > piece_len as u64 {
            return Err(PeerError::InvalidMessage(format!(
                "request {}+{}:{} past end of piece",
                index, begin, length
            )));
        }
        Ok(BlockRequest::new(index, begin, length))
    }
}

fn message_name(message: &Message) -> &'static str {
    match message {
        Message::Handshake(_) => "handshake",
        Message::KeepAlive => "keep-alive",
        Message::Choke => "choke",
        Message::Unchoke => "unchoke",
        Message::Interested => "interested",
        Message::NotInterested => "not interested",
        Message::Have { .. } => "have",
        Message::Bitfield(_) => "bitfield",
        Message::Request { .. } => "request",
        Message::Piece { .. } => "piece",
        Message::Cancel { .. } => "cancel",
        Message::Port(_) => "port",
    }
}

/// One connection to one remote peer.
///
/// A session runs five tasks: the pump reading and routing inbound
/// messages, and the send, download, upload and keep-alive roles. They talk
/// through bounded mailboxes and stop together when the session closes.
///
/// # Examples
///
/// ```no_run
/// use bitswarm::peer::{ConnectionType, PeerId, PeerSession, SessionKey, SessionParams};
/// use bitswarm::metainfo::PieceLayout;
/// use bitswarm::storage::{MemoryStorage, PieceStore};
/// use bitswarm::{BandwidthLimiter, PieceConfig, PieceManager, SessionConfig};
/// use std::sync::Arc;
/// use tokio::net::TcpStream;
/// use tokio::sync::mpsc;
///
/// # async fn example(layout: Arc<PieceLayout>) -> Result<(), Box<dyn std::error::Error>> {
/// let store = Arc::new(MemoryStorage::new(layout.clone()));
/// let (manager, _completed) = PieceManager::new(layout, store.verify()?, PieceConfig::default())?;
/// let (events, _events_rx) = mpsc::unbounded_channel();
///
/// let stream = TcpStream::connect("192.168.1.100:6881").await?;
/// let session = PeerSession::start(
///     stream,
///     SessionParams {
///         key: SessionKey(1),
///         connection_type: ConnectionType::Outgoing,
///         info_hash: [0u8; 20],
///         local_id: PeerId::generate(),
///         manager,
///         store,
///         limiter: Arc::new(BandwidthLimiter::unlimited()),
///         config: SessionConfig::default(),
///         events,
///     },
/// )
/// .await?;
///
/// session.dispose();
/// session.join().await;
/// # Ok(())
/// # }
/// ```
pub struct PeerSession;

impl PeerSession {
    /// Starts a session over `stream`.
    ///
    /// For outgoing connections the handshake is written before this
    /// returns, so a peer that cannot be written to fails here rather than
    /// through an event.
    pub async fn start<S>(stream: S, params: SessionParams) -> Result<SessionHandle, PeerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let SessionParams {
            key,
            connection_type,
            info_hash,
            local_id,
            manager,
            store,
            limiter,
            config,
            events,
        } = params;

        let (reader, mut writer) = split_stream(stream, limiter);

        let mut handshake = HandshakeState::None;
        if connection_type == ConnectionType::Outgoing {
            handshake.on_sent()?;
            writer
                .write_message(&Message::Handshake(Handshake::new(
                    info_hash,
                    *local_id.as_bytes(),
                )))
                .await?;
        }

        let capacity = config.mailbox_capacity.max(1);
        let (send_tx, send_rx) = mpsc::channel(capacity);
        let (download_tx, download_rx) = mpsc::channel(capacity);
        let (upload_tx, upload_rx) = mpsc::channel(capacity);
        let (shutdown, _) = watch::channel(false);

        let now = Instant::now();
        let piece_count = manager.piece_count();
        let shared = Arc::new(Shared {
            key,
            info_hash,
            local_id,
            manager,
            store,
            config,
            state: Mutex::new(ProtocolState {
                handshake,
                seeding: SeedingState::Choked,
                leeching: LeechingState::Uninterested,
                remote_id: None,
                remote_bitfield: Bitfield::new(piece_count),
            }),
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            started: now,
            last_activity: Mutex::new(now),
            closed: AtomicBool::new(false),
            greeted: AtomicBool::new(false),
            shutdown,
            events,
            send_tx,
            download_tx,
            upload_tx,
        });

        debug!("{}: started {:?} session", key, connection_type);

        let tasks = vec![
            tokio::spawn(roles::pump(shared.clone(), reader)),
            tokio::spawn(roles::send(shared.clone(), writer, send_rx)),
            tokio::spawn(roles::download(shared.clone(), download_rx)),
            tokio::spawn(roles::upload(shared.clone(), upload_rx)),
            tokio::spawn(roles::keep_alive(shared.clone())),
        ];

        Ok(SessionHandle {
            shared,
            tasks: tokio::sync::Mutex::new(tasks),
        })
    }
}

/// Owner's handle on a running session.
pub struct SessionHandle {
    shared: Arc<Shared>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl SessionHandle {
    pub fn key(&self) -> SessionKey {
        self.shared.key
    }

    pub fn stats(&self) -> PeerStats {
        self.shared.stats()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Tells the peer we now have `index`. Returns false if our bitfield has
    /// not been queued yet, the session is closed, or the send mailbox is
    /// full.
    pub fn announce_have(&self, index: u32) -> bool {
        if self.shared.is_closed() || !self.shared.is_greeted() {
            return false;
        }
        self.shared
            .send_tx
            .try_send(Message::Have { piece: index })
            .is_ok()
    }

    /// Stops the session. Roles exit at their next wake-up.
    pub fn dispose(&self) {
        self.shared.close();
    }

    /// Waits for every task of the session to exit. Concurrent callers
    /// all return only after the last task is gone, so [`stats`](Self::stats)
    /// is final afterwards.
    pub async fn join(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }
}
