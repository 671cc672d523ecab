//! The tasks that make up a running session.
//!
//! Every role loops until the session's shutdown flag flips. Roles wake when
//! mail arrives; the download and keep-alive roles also wake on the poll
//! tick to check their timers.

use super::block::BlockRequest;
use super::error::PeerError;
use super::message::Message;
use super::pump::{PumpReader, PumpWriter};
use super::session::{DownloadMail, SessionEvent, Shared, UploadMail};
use super::state::SeedingState;
use crate::piece::{BlockOutcome, Piece, PieceStatus};
use rand::Rng as _;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace};

fn poll_ticker(shared: &Shared) -> Interval {
    let mut ticker = interval(shared.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Reads from the connection and routes every decoded message, in stream
/// order.
pub(super) async fn pump<R>(shared: Arc<Shared>, mut reader: PumpReader<R>)
where
    R: AsyncRead + Unpin,
{
    let mut shutdown = shared.subscribe();

    while !shared.is_closed() {
        let read = tokio::select! {
            _ = shutdown.changed() => break,
            read = reader.read_messages() => read,
        };

        let messages = match read {
            Ok(messages) => messages,
            Err(e) => {
                shared.handle_error(e);
                break;
            }
        };

        if !messages.is_empty() {
            shared.touch();
        }
        for message in messages {
            if let Err(e) = shared.route(message).await {
                shared.handle_error(e);
            }
            if shared.is_closed() {
                break;
            }
        }
    }

    let skipped = reader.decoder().skipped();
    if skipped > 0 {
        debug!("{}: skipped {} garbage bytes", shared.key, skipped);
    }
}

/// Drains the send mailbox in batches and writes each batch at once.
pub(super) async fn send<W>(
    shared: Arc<Shared>,
    mut writer: PumpWriter<W>,
    mut mailbox: mpsc::Receiver<Message>,
) where
    W: AsyncWrite + Unpin,
{
    let mut shutdown = shared.subscribe();
    let max_batch = shared.config.max_batch.max(1);
    let mut batch = Vec::with_capacity(max_batch);

    while !shared.is_closed() {
        let first = tokio::select! {
            _ = shutdown.changed() => break,
            message = mailbox.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        batch.push(first);
        while batch.len() < max_batch {
            match mailbox.try_recv() {
                Ok(message) => batch.push(message),
                Err(_) => break,
            }
        }

        let written = tokio::select! {
            _ = shutdown.changed() => break,
            written = write_batch(&shared, &mut writer, &batch) => written,
        };
        if let Err(e) = written {
            shared.handle_error(e);
        }
        batch.clear();
    }

    let _ = writer.shutdown().await;
}

async fn write_batch<W>(
    shared: &Shared,
    writer: &mut PumpWriter<W>,
    batch: &[Message],
) -> Result<(), PeerError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_batch(batch).await?;

    let payload: u64 = batch
        .iter()
        .map(|m| match m {
            Message::Piece { data, .. } => data.len() as u64,
            _ => 0,
        })
        .sum();
    shared.uploaded.fetch_add(payload, Ordering::Relaxed);
    shared.touch();
    Ok(())
}

/// Picks pieces the peer has, requests their blocks and assembles them.
pub(super) async fn download(shared: Arc<Shared>, mut mailbox: mpsc::Receiver<DownloadMail>) {
    let mut shutdown = shared.subscribe();
    let mut ticker = poll_ticker(&shared);
    let mut role = Download::new(shared.clone());

    while !shared.is_closed() {
        let result = tokio::select! {
            _ = shutdown.changed() => break,
            mail = mailbox.recv() => match mail {
                Some(mail) => role.on_mail(mail).await,
                None => break,
            },
            _ = ticker.tick() => role.on_tick().await,
        };
        if let Err(e) = result {
            shared.handle_error(e);
        }
    }
}

struct Download {
    shared: Arc<Shared>,
    piece: Option<Piece>,
    choked_since: Option<Instant>,
    choke_timeouts: u32,
}

impl Download {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            piece: None,
            choked_since: None,
            choke_timeouts: 0,
        }
    }

    async fn on_mail(&mut self, mail: DownloadMail) -> Result<(), PeerError> {
        match mail {
            DownloadMail::Choked => {
                // The lease stays with the coordinator until the sweep.
                if let Some(piece) = self.piece.take() {
                    debug!(
                        "{}: choked, abandoning piece {}",
                        self.shared.key,
                        piece.index()
                    );
                }
                self.choked_since = Some(Instant::now());
                Ok(())
            }
            DownloadMail::Unchoked => {
                self.choked_since = None;
                self.choke_timeouts = 0;
                self.pick().await
            }
            DownloadMail::Block(block) => {
                self.on_block(block.piece, block.offset, &block.data).await
            }
        }
    }

    async fn on_tick(&mut self) -> Result<(), PeerError> {
        let (handshake, seeding) = {
            let state = self.shared.state.lock();
            (state.handshake, state.seeding)
        };
        if !handshake.is_complete() {
            return Ok(());
        }

        match seeding {
            SeedingState::Unchoked => self.pick().await,
            SeedingState::Choked => self.check_choke_timeout().await,
        }
    }

    async fn check_choke_timeout(&mut self) -> Result<(), PeerError> {
        if self.shared.manager.is_complete() {
            self.choked_since = None;
            return Ok(());
        }

        let now = Instant::now();
        let since = *self.choked_since.get_or_insert(now);
        if now.duration_since(since) < self.shared.config.choke_timeout {
            return Ok(());
        }

        self.choke_timeouts += 1;
        if self.choke_timeouts >= self.shared.config.max_choke_timeouts {
            return Err(PeerError::ChokeTimeout(self.choke_timeouts));
        }

        trace!(
            "{}: still choked after {} timeouts, resending interest",
            self.shared.key,
            self.choke_timeouts
        );
        self.choked_since = Some(now);
        self.shared
            .enqueue(&self.shared.send_tx, Message::Interested)
            .await
    }

    /// Checks out a piece the peer has, starting the scan at a random index.
    async fn pick(&mut self) -> Result<(), PeerError> {
        if self.piece.is_some() {
            return Ok(());
        }

        let remote = {
            let state = self.shared.state.lock();
            if state.seeding != SeedingState::Unchoked || state.remote_bitfield.is_empty() {
                return Ok(());
            }
            state.remote_bitfield.clone()
        };

        let manager = &self.shared.manager;
        let count = remote.piece_count();
        let endgame = manager.is_endgame();
        let start = rand::rng().random_range(0..count);

        for step in 0..count {
            let index = (start + step) % count;
            if !remote.has_piece(index) {
                continue;
            }

            let index = index as u32;
            match manager.status(index)? {
                PieceStatus::Missing => {}
                PieceStatus::CheckedOut if endgame => {}
                _ => continue,
            }

            if let Some(piece) = manager.check_out(index)? {
                let requests: Vec<BlockRequest> = piece.missing_blocks().collect();
                debug!(
                    "{}: downloading piece {} in {} blocks",
                    self.shared.key,
                    index,
                    requests.len()
                );
                self.piece = Some(piece);

                for request in requests {
                    self.shared
                        .enqueue(
                            &self.shared.send_tx,
                            Message::Request {
                                index: request.piece,
                                begin: request.offset,
                                length: request.length,
                            },
                        )
                        .await?;
                }
                return Ok(());
            }
        }

        Ok(())
    }

    async fn on_block(&mut self, index: u32, offset: u32, data: &[u8]) -> Result<(), PeerError> {
        let Some(piece) = self.piece.as_mut().filter(|p| p.index() == index) else {
            trace!("{}: stale block {}+{}", self.shared.key, index, offset);
            return Ok(());
        };

        match piece.put_block(offset, data)? {
            BlockOutcome::Accepted | BlockOutcome::Duplicate => Ok(()),
            BlockOutcome::Completed(data) => {
                self.piece = None;
                self.shared.manager.on_piece_completed(index, data)?;
                self.pick().await
            }
            BlockOutcome::Corrupted => {
                self.piece = None;
                self.shared.raise(SessionEvent::PieceCorrupted {
                    key: self.shared.key,
                    index,
                });
                Err(PeerError::CorruptPiece(index))
            }
        }
    }
}

/// Answers block requests for pieces we have.
pub(super) async fn upload(shared: Arc<Shared>, mut mailbox: mpsc::Receiver<UploadMail>) {
    let mut shutdown = shared.subscribe();
    let mut queue: VecDeque<BlockRequest> = VecDeque::new();

    while !shared.is_closed() {
        let mail = tokio::select! {
            _ = shutdown.changed() => break,
            mail = mailbox.recv() => match mail {
                Some(mail) => mail,
                None => break,
            },
        };

        queue_mail(&mut queue, mail);
        while let Ok(mail) = mailbox.try_recv() {
            queue_mail(&mut queue, mail);
        }

        while let Some(request) = queue.pop_front() {
            if let Err(e) = serve(&shared, request).await {
                shared.handle_error(e);
            }
            if shared.is_closed() {
                break;
            }
        }
    }
}

fn queue_mail(queue: &mut VecDeque<BlockRequest>, mail: UploadMail) {
    match mail {
        UploadMail::Request(request) => queue.push_back(request),
        UploadMail::Cancel(request) => queue.retain(|queued| *queued != request),
    }
}

async fn serve(shared: &Shared, request: BlockRequest) -> Result<(), PeerError> {
    if shared.manager.status(request.piece)? != PieceStatus::Present {
        return Err(PeerError::UnexpectedMessage(format!(
            "request for piece {} we do not have",
            request.piece
        )));
    }

    let data = shared.store.get(request.piece)?;
    let start = request.offset as usize;
    let end = start + request.length as usize;
    if end > data.len() {
        return Err(PeerError::InvalidMessage(format!(
            "request {}+{}:{} past stored piece of {} bytes",
            request.piece,
            request.offset,
            request.length,
            data.len()
        )));
    }

    shared
        .enqueue(
            &shared.send_tx,
            Message::Piece {
                index: request.piece,
                begin: request.offset,
                data: data.slice(start..end),
            },
        )
        .await
}

/// Tears the session down once nothing moved in either direction for the
/// keep-alive window.
pub(super) async fn keep_alive(shared: Arc<Shared>) {
    let mut shutdown = shared.subscribe();
    let mut ticker = poll_ticker(&shared);

    while !shared.is_closed() {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        if shared.last_activity().elapsed() > shared.config.keep_alive_timeout {
            shared.handle_error(PeerError::Timeout);
            break;
        }
    }
}
