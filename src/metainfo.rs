//! Piece layout of a transfer.
//!
//! The torrent description itself is decoded elsewhere. This module holds the
//! part of it the engine needs: total length, piece length and the ordered
//! SHA-1 digest of every piece.
//!
//! # Examples
//!
//! ```
//! use bitswarm::metainfo::{PieceHash, PieceLayout};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let data = vec![7u8; 1500];
//! let hashes: Vec<u8> = data
//!     .chunks(1024)
//!     .flat_map(|chunk| PieceHash::of(chunk).0)
//!     .collect();
//!
//! let layout = PieceLayout::from_hash_list(1500, 1024, &hashes)?;
//! assert_eq!(layout.piece_count(), 2);
//! assert_eq!(layout.piece_len(1), Some(476));
//! # Ok(())
//! # }
//! ```

mod error;
mod layout;
mod piece_hash;

pub use error::MetainfoError;
pub use layout::PieceLayout;
pub use piece_hash::PieceHash;

#[cfg(test)]
mod tests;
