use super::error::PeerError;
use bytes::Bytes;

/// Piece availability of one side of a connection, one bit per piece.
///
/// Bit 0 is the high bit of the first byte, as on the wire. Indices past
/// `piece_count` read as absent and writes to them are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Parses the payload of a `Bitfield` message.
    ///
    /// The payload must be exactly `ceil(piece_count / 8)` bytes. Spare bits
    /// in the last byte are cleared.
    pub fn try_from_bytes(bytes: &[u8], piece_count: usize) -> Result<Self, PeerError> {
        let expected = piece_count.div_ceil(8);
        if bytes.len() != expected {
            return Err(PeerError::InvalidMessage(format!(
                "bitfield of {} bytes for {} pieces",
                bytes.len(),
                piece_count
            )));
        }

        let mut bitfield = Self {
            bits: bytes.to_vec(),
            piece_count,
        };
        let spare = expected * 8 - piece_count;
        if let Some(last) = bitfield.bits.last_mut() {
            *last &= 0xFFu8 << spare;
        }
        Ok(bitfield)
    }

    fn slot(&self, index: usize) -> Option<(usize, u8)> {
        (index < self.piece_count).then(|| (index / 8, 0x80 >> (index % 8)))
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.slot(index)
            .is_some_and(|(byte, mask)| self.bits[byte] & mask != 0)
    }

    pub fn set_piece(&mut self, index: usize) {
        if let Some((byte, mask)) = self.slot(index) {
            self.bits[byte] |= mask;
        }
    }

    pub fn clear_piece(&mut self, index: usize) {
        if let Some((byte, mask)) = self.slot(index) {
            self.bits[byte] &= !mask;
        }
    }

    /// Number of pieces marked present.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Wire payload for a `Bitfield` message.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Indices of the pieces marked present, ascending.
    pub fn pieces(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(|&index| self.has_piece(index))
    }
}
