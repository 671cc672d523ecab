use super::*;

fn layout_for(data: &[u8], piece_length: u32) -> PieceLayout {
    let hashes = data
        .chunks(piece_length as usize)
        .map(PieceHash::of)
        .collect();
    PieceLayout::new(data.len() as u64, piece_length, hashes).unwrap()
}

#[test]
fn test_piece_hash_hex_is_case_insensitive() {
    let hash = PieceHash::of(b"hello");
    let lower = hash.to_hex();
    let upper = lower.to_uppercase();

    assert_eq!(lower.len(), 40);
    assert_eq!(PieceHash::from_hex(&lower).unwrap(), hash);
    assert_eq!(PieceHash::from_hex(&upper).unwrap(), hash);
    assert!(hash.matches(b"hello"));
    assert!(!hash.matches(b"hellO"));
}

#[test]
fn test_piece_hash_rejects_bad_hex() {
    assert!(PieceHash::from_hex("abc").is_err());
    assert!(PieceHash::from_hex(&"zz".repeat(20)).is_err());
    assert!(PieceHash::from_hex(&"ab".repeat(19)).is_err());
}

#[test]
fn test_hash_list_must_be_multiple_of_20() {
    let result = PieceLayout::from_hash_list(100, 50, &[0u8; 39]);
    assert!(matches!(result, Err(MetainfoError::InvalidHashList(39))));
}

#[test]
fn test_hash_count_must_match_piece_count() {
    let result = PieceLayout::from_hash_list(100, 50, &[0u8; 20]);
    assert!(matches!(
        result,
        Err(MetainfoError::PieceCountMismatch {
            expected: 2,
            actual: 1
        })
    ));
}

#[test]
fn test_zero_piece_length_rejected() {
    assert!(PieceLayout::new(0, 0, Vec::new()).is_err());
}

#[test]
fn test_last_piece_is_clamped() {
    let data = vec![1u8; 2500];
    let layout = layout_for(&data, 1000);

    assert_eq!(layout.piece_count(), 3);
    assert_eq!(layout.piece_len(0), Some(1000));
    assert_eq!(layout.piece_len(2), Some(500));
    assert_eq!(layout.piece_len(3), None);
}

#[test]
fn test_block_geometry() {
    let data = vec![0u8; 16384 * 2 + 100];
    let layout = layout_for(&data, 16384 * 3);

    assert_eq!(layout.block_count(0, 16384), Some(3));
    assert_eq!(layout.block_len(0, 0, 16384), Some(16384));
    assert_eq!(layout.block_len(0, 32768, 16384), Some(100));
    assert_eq!(layout.block_len(0, 100, 16384), None);
    assert_eq!(layout.block_len(0, 49152, 16384), None);
}
