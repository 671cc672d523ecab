/// Download status of a single piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PieceStatus {
    /// Not held and not being downloaded.
    Missing,
    /// Leased to at least one peer session.
    CheckedOut,
    /// Verified and handed to storage.
    Present,
    /// Overlaps both a wanted and an unwanted file.
    Partial,
    /// Lies entirely inside unwanted files.
    Ignore,
}

impl PieceStatus {
    /// Returns true for pieces that count towards completion.
    pub fn is_relevant(self) -> bool {
        self != PieceStatus::Ignore
    }
}
