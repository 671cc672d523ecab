use super::*;
use crate::config::PieceConfig;
use crate::metainfo::{PieceHash, PieceLayout};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;

const BLOCK: u32 = 16;

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn layout_for(data: &[u8], piece_length: u32) -> Arc<PieceLayout> {
    let hashes = data.chunks(piece_length as usize).map(PieceHash::of).collect();
    Arc::new(PieceLayout::new(data.len() as u64, piece_length, hashes).unwrap())
}

fn config() -> PieceConfig {
    PieceConfig::default().with_block_size(BLOCK)
}

fn fill(piece: &mut Piece, data: &[u8]) -> BlockOutcome {
    let mut outcome = BlockOutcome::Accepted;
    for offset in (0..piece.length()).step_by(BLOCK as usize) {
        let end = (offset + BLOCK).min(piece.length()) as usize;
        outcome = piece.put_block(offset, &data[offset as usize..end]).unwrap();
    }
    outcome
}

#[test]
fn test_put_block_is_idempotent() {
    let data = content(64);
    let mut piece = Piece::new(0, PieceHash::of(&data), 64, BLOCK);
    assert_eq!(piece.block_count(), 4);

    assert_eq!(piece.put_block(16, &data[16..32]).unwrap(), BlockOutcome::Accepted);
    assert_eq!(piece.completed_blocks(), 1);
    assert!(piece.has_block(16));

    assert_eq!(piece.put_block(16, &data[16..32]).unwrap(), BlockOutcome::Duplicate);
    assert_eq!(piece.completed_blocks(), 1);

    let missing: Vec<u32> = piece.missing_blocks().map(|r| r.offset).collect();
    assert_eq!(missing, vec![0, 32, 48]);
}

#[test]
fn test_short_last_block() {
    let data = content(40);
    let mut piece = Piece::new(3, PieceHash::of(&data), 40, BLOCK);
    assert_eq!(piece.block_count(), 3);
    assert_eq!(piece.block_len(2), 8);

    let last = piece.missing_blocks().last().unwrap();
    assert_eq!((last.offset, last.length), (32, 8));

    assert!(matches!(
        piece.put_block(32, &data[32..40]).unwrap(),
        BlockOutcome::Accepted
    ));
    assert!(matches!(
        piece.put_block(0, &data[0..8]),
        Err(PieceError::InvalidBlockLength {
            expected: 16,
            actual: 8,
            ..
        })
    ));
}

#[test]
fn test_put_block_rejects_bad_offsets() {
    let data = content(64);
    let mut piece = Piece::new(0, PieceHash::of(&data), 64, BLOCK);

    assert!(matches!(
        piece.put_block(5, &data[5..21]),
        Err(PieceError::MisalignedOffset { offset: 5, .. })
    ));
    assert!(matches!(
        piece.put_block(64, &data[..16]),
        Err(PieceError::OffsetOutOfRange { offset: 64, .. })
    ));
    assert_eq!(piece.completed_blocks(), 0);
}

#[test]
fn test_piece_completes_with_data() {
    let data = content(64);
    let mut piece = Piece::new(0, PieceHash::of(&data), 64, BLOCK);

    match fill(&mut piece, &data) {
        BlockOutcome::Completed(bytes) => assert_eq!(&bytes[..], &data[..]),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(piece.is_completed());
    assert_eq!(piece.state(), PieceState::Completed);
}

#[test]
fn test_piece_detects_corruption() {
    let data = content(64);
    let mut corrupted = data.clone();
    corrupted[20] ^= 0x01;

    let mut piece = Piece::new(1, PieceHash::of(&data), 64, BLOCK);
    assert_eq!(fill(&mut piece, &corrupted), BlockOutcome::Corrupted);
    assert!(piece.is_corrupted());
    assert!(!piece.is_completed());
}

#[test]
fn test_manager_rejects_status_count_mismatch() {
    let data = content(64);
    let result = PieceManager::new(layout_for(&data, 32), vec![PieceStatus::Missing], config());
    assert!(matches!(
        result,
        Err(PieceError::StatusCountMismatch {
            expected: 2,
            actual: 1
        })
    ));
}

#[test]
fn test_manager_rejects_zero_block_size() {
    let data = content(64);
    let result = PieceManager::new(
        layout_for(&data, 32),
        vec![PieceStatus::Missing; 2],
        config().with_block_size(0),
    );
    assert!(matches!(result, Err(PieceError::InvalidBlockSize)));
}

#[test]
fn test_revoke_returns_present_piece_to_missing() {
    let data = content(64);
    let (manager, mut rx) =
        PieceManager::new(layout_for(&data, 32), vec![PieceStatus::Missing; 2], config()).unwrap();

    manager.check_out(0).unwrap().unwrap();
    assert!(manager
        .on_piece_completed(0, Bytes::copy_from_slice(&data[..32]))
        .unwrap());
    assert_eq!(rx.try_recv().unwrap().index, 0);
    assert_eq!(manager.present_count(), 1);

    assert!(manager.revoke(0).unwrap());
    assert_eq!(manager.status(0).unwrap(), PieceStatus::Missing);
    assert_eq!(manager.present_count(), 0);
    assert_eq!(manager.completed_ratio(), 0.0);

    // Only present pieces can be revoked.
    assert!(!manager.revoke(0).unwrap());
    assert!(!manager.revoke(1).unwrap());

    // The piece can be downloaded again.
    assert!(manager.check_out(0).unwrap().is_some());
}

#[test]
fn test_restored_checkouts_become_missing() {
    let data = content(64);
    let (manager, _rx) = PieceManager::new(
        layout_for(&data, 32),
        vec![PieceStatus::CheckedOut, PieceStatus::Present],
        config(),
    )
    .unwrap();

    assert_eq!(manager.status(0).unwrap(), PieceStatus::Missing);
    assert_eq!(manager.present_count(), 1);
    assert!(manager.checked_out().is_empty());
}

#[test]
fn test_scenario_first_of_four_pieces() {
    // 4 pieces of 16 blocks each.
    let piece_length = 16 * BLOCK;
    let data = content(4 * piece_length as usize);
    let (manager, mut completed) = PieceManager::new(
        layout_for(&data, piece_length),
        vec![PieceStatus::Missing; 4],
        config(),
    )
    .unwrap();

    let mut piece = manager.check_out(0).unwrap().unwrap();
    assert_eq!(piece.block_count(), 16);
    assert_eq!(manager.status(0).unwrap(), PieceStatus::CheckedOut);

    let BlockOutcome::Completed(bytes) = fill(&mut piece, &data[..piece_length as usize]) else {
        panic!("piece 0 should verify");
    };
    assert!(manager.on_piece_completed(0, bytes).unwrap());

    assert_eq!(manager.status(0).unwrap(), PieceStatus::Present);
    assert_eq!(manager.completed_ratio(), 0.25);
    assert!(manager.checked_out().is_empty());

    let event = completed.try_recv().unwrap();
    assert_eq!(event.index, 0);
    assert_eq!(event.data.len(), piece_length as usize);
    assert_eq!(&event.data[..], &data[..piece_length as usize]);
    assert!(manager.present_bitfield().has_piece(0));
}

#[test]
fn test_scenario_corrupted_piece_waits_for_sweep() {
    let piece_length = 16 * BLOCK;
    let data = content(4 * piece_length as usize);
    let (manager, mut completed) = PieceManager::new(
        layout_for(&data, piece_length),
        vec![PieceStatus::Missing; 4],
        config(),
    )
    .unwrap();

    let checked_out_at = Instant::now();
    let mut piece = manager.check_out(1).unwrap().unwrap();
    let mut bad = data[piece_length as usize..2 * piece_length as usize].to_vec();
    bad[100] ^= 0xFF;

    assert_eq!(fill(&mut piece, &bad), BlockOutcome::Corrupted);
    assert!(piece.is_corrupted());
    assert_eq!(completed.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(manager.status(1).unwrap(), PieceStatus::CheckedOut);

    let timeout = manager.config().checkout_timeout;
    assert!(manager.sweep_expired(checked_out_at + timeout).is_empty());

    let reclaimed = manager.sweep_expired(checked_out_at + timeout + Duration::from_secs(1));
    assert_eq!(reclaimed, vec![1]);
    assert_eq!(manager.status(1).unwrap(), PieceStatus::Missing);
    assert!(manager.checked_out().is_empty());
}

#[test]
fn test_checkout_is_exclusive_outside_endgame() {
    let data = content(128);
    let (manager, _rx) =
        PieceManager::new(layout_for(&data, 32), vec![PieceStatus::Missing; 4], config()).unwrap();

    assert!(!manager.is_endgame());
    let first = manager.check_out(2).unwrap();
    assert!(first.is_some());
    assert!(manager.check_out(2).unwrap().is_none());
    assert_eq!(manager.checked_out(), vec![2]);
}

#[test]
fn test_checkout_refuses_present_partial_and_ignored() {
    let data = content(128);
    let (manager, _rx) = PieceManager::new(
        layout_for(&data, 32),
        vec![
            PieceStatus::Present,
            PieceStatus::Partial,
            PieceStatus::Ignore,
            PieceStatus::Missing,
        ],
        config(),
    )
    .unwrap();

    assert!(manager.check_out(0).unwrap().is_none());
    assert!(manager.check_out(1).unwrap().is_none());
    assert!(manager.check_out(2).unwrap().is_none());
    assert!(manager.check_out(3).unwrap().is_some());
}

#[test]
fn test_ignored_pieces_do_not_count() {
    let data = content(64);
    let (manager, _rx) = PieceManager::new(
        layout_for(&data, 32),
        vec![PieceStatus::Missing, PieceStatus::Ignore],
        config(),
    )
    .unwrap();

    assert!(!manager.is_complete());
    manager
        .on_piece_completed(0, Bytes::copy_from_slice(&data[..32]))
        .unwrap();
    assert!(manager.is_complete());
    assert_eq!(manager.completed_ratio(), 1.0);
}

#[test]
fn test_endgame_allows_two_holders_and_completes_once() {
    let data = content(20 * 32);
    let mut statuses = vec![PieceStatus::Present; 20];
    statuses[19] = PieceStatus::Missing;
    let (manager, mut completed) =
        PieceManager::new(layout_for(&data, 32), statuses, config()).unwrap();

    assert!(manager.is_endgame());

    let mut first = manager.check_out(19).unwrap().unwrap();
    let mut second = manager.check_out(19).unwrap().unwrap();
    assert!(manager.check_out(19).unwrap().is_none());

    let expected = &data[19 * 32..];
    let BlockOutcome::Completed(a) = fill(&mut first, expected) else {
        panic!("first copy should verify");
    };
    let BlockOutcome::Completed(b) = fill(&mut second, expected) else {
        panic!("second copy should verify");
    };

    assert!(manager.on_piece_completed(19, a).unwrap());
    assert!(!manager.on_piece_completed(19, b).unwrap());

    assert_eq!(manager.present_count(), 20);
    assert!(manager.is_complete());
    assert_eq!(completed.try_recv().unwrap().index, 19);
    assert_eq!(completed.try_recv(), Err(TryRecvError::Empty));
}

#[test]
fn test_out_of_range_index_is_rejected() {
    let data = content(64);
    let (manager, _rx) =
        PieceManager::new(layout_for(&data, 32), vec![PieceStatus::Missing; 2], config()).unwrap();

    assert!(matches!(manager.check_out(2), Err(PieceError::InvalidIndex(2))));
    assert!(matches!(manager.status(7), Err(PieceError::InvalidIndex(7))));
    assert!(matches!(
        manager.on_piece_completed(2, Bytes::new()),
        Err(PieceError::InvalidIndex(2))
    ));
}

#[test]
fn test_sweep_keeps_fresh_checkouts() {
    let data = content(64);
    let (manager, _rx) =
        PieceManager::new(layout_for(&data, 32), vec![PieceStatus::Missing; 2], config()).unwrap();

    let start = Instant::now();
    manager.check_out(0).unwrap().unwrap();
    manager.check_out(1).unwrap().unwrap();

    assert!(manager.sweep_expired(start + Duration::from_secs(60)).is_empty());
    assert_eq!(manager.checked_out(), vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_reclaims_stalled_checkout() {
    let data = content(64);
    let (manager, _rx) = PieceManager::new(
        layout_for(&data, 32),
        vec![PieceStatus::Missing; 2],
        config()
            .with_checkout_timeout(Duration::from_secs(120))
            .with_sweep_interval(Duration::from_secs(10)),
    )
    .unwrap();
    manager.start_sweeper();

    let _stalled = manager.check_out(0).unwrap().unwrap();

    tokio::time::sleep(Duration::from_secs(115)).await;
    assert_eq!(manager.status(0).unwrap(), PieceStatus::CheckedOut);

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(manager.status(0).unwrap(), PieceStatus::Missing);
    assert!(manager.check_out(0).unwrap().is_some());

    manager.dispose();
}

#[test]
fn test_dispose_invalidates_manager() {
    let data = content(64);
    let (manager, _rx) =
        PieceManager::new(layout_for(&data, 32), vec![PieceStatus::Missing; 2], config()).unwrap();

    manager.dispose();
    assert!(manager.is_disposed());
    assert!(matches!(manager.check_out(0), Err(PieceError::Disposed)));
    assert!(matches!(manager.status(0), Err(PieceError::Disposed)));
    assert!(manager.sweep().is_empty());
}
