use super::*;
use crate::config::{PieceConfig, SessionConfig};
use crate::metainfo::{PieceHash, PieceLayout};
use crate::peer::{split_stream, Handshake, Message, PeerError};
use crate::piece::{PieceError, PieceStatus};
use crate::storage::{MemoryStorage, PieceStore, StorageError};
use bytes::Bytes;
use std::time::Duration;
use tokio::time::timeout;

const INFO_HASH: [u8; 20] = [0x42; 20];
const PIECE_LENGTH: u32 = 64;

fn content() -> Vec<u8> {
    // 7 full pieces and a short one.
    (0..7 * PIECE_LENGTH as usize + 40)
        .map(|i| (i * 13 % 256) as u8)
        .collect()
}

fn layout(content: &[u8]) -> Arc<PieceLayout> {
    let hashes = content
        .chunks(PIECE_LENGTH as usize)
        .map(PieceHash::of)
        .collect();
    Arc::new(PieceLayout::new(content.len() as u64, PIECE_LENGTH, hashes).unwrap())
}

fn config() -> Config {
    Config::default()
        .with_pieces(PieceConfig::default().with_block_size(16))
        .with_session(SessionConfig::default().with_poll_interval(Duration::from_millis(10)))
}

fn transfer(info_hash: [u8; 20], store: Arc<MemoryStorage>, layout: Arc<PieceLayout>) -> Transfer {
    Transfer::new(info_hash, PeerId::generate(), layout, store, config()).unwrap()
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_seeder_to_leecher() {
    let content = content();
    let layout = layout(&content);

    let seed_store = Arc::new(MemoryStorage::with_content(layout.clone(), &content).unwrap());
    let leech_store = Arc::new(MemoryStorage::new(layout.clone()));
    let seeder = transfer(INFO_HASH, seed_store, layout.clone());
    let leecher = transfer(INFO_HASH, leech_store.clone(), layout.clone());

    assert!(seeder.is_complete());
    assert!(!leecher.is_complete());

    let (a, b) = tokio::io::duplex(64 * 1024);
    seeder.add_peer(a, ConnectionType::Incoming).await.unwrap();
    leecher.add_peer(b, ConnectionType::Outgoing).await.unwrap();

    timeout(Duration::from_secs(10), leecher.wait_complete())
        .await
        .expect("download did not finish");

    assert!(leecher.is_complete());
    for index in 0..layout.piece_count() as u32 {
        let start = (index * PIECE_LENGTH) as usize;
        let end = (start + PIECE_LENGTH as usize).min(content.len());
        assert_eq!(&leech_store.get(index).unwrap()[..], &content[start..end]);
    }
    assert_eq!(leech_store.verify().unwrap().len(), layout.piece_count());

    assert!(leecher.totals().downloaded >= content.len() as u64);
    eventually(|| seeder.totals().uploaded >= content.len() as u64).await;

    leecher.shutdown().await;
    assert_eq!(leecher.peer_count(), 0);
    assert!(leecher.totals().downloaded >= content.len() as u64);

    // The seeder sees the stream close and drops the session.
    eventually(|| seeder.peer_count() == 0).await;
    assert!(seeder.totals().uploaded >= content.len() as u64);
    seeder.shutdown().await;
}

#[tokio::test]
async fn test_leecher_with_two_seeders() {
    let content = content();
    let layout = layout(&content);

    let leech_store = Arc::new(MemoryStorage::new(layout.clone()));
    let leecher = transfer(INFO_HASH, leech_store.clone(), layout.clone());

    let mut seeders = Vec::new();
    for _ in 0..2 {
        let store = Arc::new(MemoryStorage::with_content(layout.clone(), &content).unwrap());
        let seeder = transfer(INFO_HASH, store, layout.clone());
        let (a, b) = tokio::io::duplex(64 * 1024);
        seeder.add_peer(a, ConnectionType::Incoming).await.unwrap();
        leecher.add_peer(b, ConnectionType::Outgoing).await.unwrap();
        seeders.push(seeder);
    }
    assert_eq!(leecher.peer_count(), 2);

    timeout(Duration::from_secs(10), leecher.wait_complete())
        .await
        .expect("download did not finish");

    assert_eq!(leech_store.stored_count(), layout.piece_count());
    assert_eq!(leecher.peer_stats().len(), 2);

    leecher.shutdown().await;
    for seeder in seeders {
        seeder.shutdown().await;
    }
}

#[tokio::test]
async fn test_mismatched_info_hash_drops_peer() {
    let content = content();
    let layout = layout(&content);

    let seed_store = Arc::new(MemoryStorage::with_content(layout.clone(), &content).unwrap());
    let seeder = transfer(INFO_HASH, seed_store, layout.clone());
    let stranger = transfer([0x01; 20], Arc::new(MemoryStorage::new(layout.clone())), layout);

    let (a, b) = tokio::io::duplex(64 * 1024);
    seeder.add_peer(a, ConnectionType::Incoming).await.unwrap();
    stranger.add_peer(b, ConnectionType::Outgoing).await.unwrap();

    eventually(|| seeder.peer_count() == 0 && stranger.peer_count() == 0).await;
    assert_eq!(seeder.totals(), TransferStats::default());
    assert!(!stranger.is_complete());
}

#[tokio::test]
async fn test_completed_pieces_are_announced() {
    let content = content();
    let layout = layout(&content);

    let seed_store = Arc::new(MemoryStorage::with_content(layout.clone(), &content).unwrap());
    let seeder = transfer(INFO_HASH, seed_store, layout.clone());
    let leecher = transfer(INFO_HASH, Arc::new(MemoryStorage::new(layout.clone())), layout.clone());

    // A bystander that never unchokes the leecher, only listens.
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    leecher
        .add_peer(ours, ConnectionType::Incoming)
        .await
        .unwrap();
    let limiter = Arc::new(BandwidthLimiter::unlimited());
    let (mut reader, mut writer) = split_stream(theirs, limiter);
    writer
        .write_message(&Message::Handshake(Handshake::new(INFO_HASH, [9u8; 20])))
        .await
        .unwrap();

    // The greeting follows the handshake reply, so once it arrives the
    // session accepts announcements.
    timeout(Duration::from_secs(10), async {
        loop {
            let messages = reader.read_messages().await.unwrap();
            if messages.contains(&Message::Unchoke) {
                break;
            }
        }
    })
    .await
    .expect("no greeting from the leecher");

    let (a, b) = tokio::io::duplex(64 * 1024);
    seeder.add_peer(a, ConnectionType::Incoming).await.unwrap();
    leecher.add_peer(b, ConnectionType::Outgoing).await.unwrap();

    let mut announced = Vec::new();
    timeout(Duration::from_secs(10), async {
        while announced.len() < layout.piece_count() {
            for message in reader.read_messages().await? {
                if let Message::Have { piece } = message {
                    announced.push(piece);
                }
            }
        }
        Ok::<_, PeerError>(())
    })
    .await
    .expect("not every piece was announced")
    .unwrap();

    announced.sort_unstable();
    let expected: Vec<u32> = (0..layout.piece_count() as u32).collect();
    assert_eq!(announced, expected);

    leecher.shutdown().await;
    seeder.shutdown().await;
}

#[tokio::test]
async fn test_add_peer_after_shutdown_fails() {
    let content = content();
    let layout = layout(&content);
    let transfer = transfer(INFO_HASH, Arc::new(MemoryStorage::new(layout.clone())), layout);

    transfer.shutdown().await;
    assert!(transfer.manager().is_disposed());

    let (a, _b) = tokio::io::duplex(1024);
    assert!(matches!(
        transfer.add_peer(a, ConnectionType::Incoming).await,
        Err(TransferError::ShutDown)
    ));
}

/// Memory storage whose first write of piece 0 fails.
struct FlakyStore {
    inner: MemoryStorage,
    fail_next_put: AtomicBool,
}

impl PieceStore for FlakyStore {
    fn verify(&self) -> Result<Vec<PieceStatus>, StorageError> {
        self.inner.verify()
    }

    fn get(&self, index: u32) -> Result<Bytes, StorageError> {
        self.inner.get(index)
    }

    fn put(&self, index: u32, data: Bytes) -> Result<(), StorageError> {
        if index == 0 && self.fail_next_put.swap(false, Ordering::AcqRel) {
            return Err(std::io::Error::other("disk full").into());
        }
        self.inner.put(index, data)
    }
}

#[tokio::test]
async fn test_failed_store_is_downloaded_again() {
    let content = content();
    let layout = layout(&content);

    let seed_store = Arc::new(MemoryStorage::with_content(layout.clone(), &content).unwrap());
    let seeder = transfer(INFO_HASH, seed_store, layout.clone());
    let leech_store = Arc::new(FlakyStore {
        inner: MemoryStorage::new(layout.clone()),
        fail_next_put: AtomicBool::new(true),
    });
    let leecher = Transfer::new(
        INFO_HASH,
        PeerId::generate(),
        layout.clone(),
        leech_store.clone(),
        config(),
    )
    .unwrap();

    let (a, b) = tokio::io::duplex(64 * 1024);
    seeder.add_peer(a, ConnectionType::Incoming).await.unwrap();
    leecher.add_peer(b, ConnectionType::Outgoing).await.unwrap();

    timeout(Duration::from_secs(10), leecher.wait_complete())
        .await
        .expect("download did not finish");

    assert!(!leech_store.fail_next_put.load(Ordering::Acquire));
    assert_eq!(leech_store.inner.stored_count(), layout.piece_count());
    assert_eq!(
        &leech_store.get(0).unwrap()[..],
        &content[..PIECE_LENGTH as usize]
    );
    assert!(leecher.is_complete());

    leecher.shutdown().await;
    seeder.shutdown().await;
}

#[tokio::test]
async fn test_zero_block_size_is_rejected() {
    let content = content();
    let layout = layout(&content);
    let result = Transfer::new(
        INFO_HASH,
        PeerId::generate(),
        layout.clone(),
        Arc::new(MemoryStorage::new(layout)),
        Config::default().with_pieces(PieceConfig::default().with_block_size(0)),
    );
    assert!(matches!(
        result,
        Err(TransferError::Piece(PieceError::InvalidBlockSize))
    ));
}

#[tokio::test]
async fn test_closed_session_counters_are_folded() {
    let content = content();
    let layout = layout(&content);
    let leecher = transfer(INFO_HASH, Arc::new(MemoryStorage::new(layout.clone())), layout.clone());

    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    leecher
        .add_peer(ours, ConnectionType::Outgoing)
        .await
        .unwrap();
    let (mut reader, mut writer) = split_stream(theirs, Arc::new(BandwidthLimiter::unlimited()));

    // Eight pieces, all present.
    let bitfield = Bytes::from_static(&[0xFF]);
    writer
        .write_batch(&[
            Message::Handshake(Handshake::new(INFO_HASH, [9u8; 20])),
            Message::Bitfield(bitfield),
            Message::Unchoke,
        ])
        .await
        .unwrap();

    // Serve the first piece asked for, then hang up.
    let mut piece = None;
    let mut served = 0u64;
    timeout(Duration::from_secs(10), async {
        loop {
            for message in reader.read_messages().await.unwrap() {
                let Message::Request {
                    index,
                    begin,
                    length,
                } = message
                else {
                    continue;
                };
                if *piece.get_or_insert(index) != index {
                    continue;
                }
                let start = (index * PIECE_LENGTH + begin) as usize;
                let data = Bytes::copy_from_slice(&content[start..start + length as usize]);
                writer
                    .write_message(&Message::Piece { index, begin, data })
                    .await
                    .unwrap();
                served += length as u64;
            }
            if piece.and_then(|index| layout.piece_len(index)) == Some(served as u32) {
                break;
            }
        }
    })
    .await
    .expect("piece was not requested");

    eventually(|| leecher.manager().present_count() == 1).await;
    drop(reader);
    drop(writer);

    eventually(|| leecher.peer_count() == 0).await;
    assert_eq!(leecher.totals().downloaded, served);
    leecher.shutdown().await;
    assert_eq!(leecher.totals().downloaded, served);
}
