//! Piece assembly and cross-peer piece assignment.
//!
//! A [`Piece`] collects the blocks of one piece and verifies the result
//! against its SHA-1 digest. The [`PieceManager`] owns the status of every
//! piece in a transfer and hands out checkouts so that, outside of endgame,
//! each piece is downloaded from a single peer at a time.
//!
//! # Status transitions
//!
//! ```text
//! Missing ──check_out──▶ CheckedOut ──completed──▶ Present
//!    ▲                        │
//!    └──────── sweep ─────────┘
//! ```
//!
//! `Partial` and `Ignore` are assigned once from storage verification and
//! never change.

mod error;
mod manager;
mod status;
mod unit;

pub use error::PieceError;
pub use manager::{CompletedPiece, PieceManager};
pub use status::PieceStatus;
pub use unit::{BlockOutcome, Piece, PieceState};

#[cfg(test)]
mod tests;
