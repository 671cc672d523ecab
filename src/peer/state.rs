use super::error::PeerError;
use super::peer_id::PeerId;
use std::time::Duration;

/// Progress of the handshake exchange.
///
/// ```text
/// None --sent--> SentNotReceived --received--> Complete
/// None --received--> ReceivedNotSent --sent--> Complete
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    None,
    SentNotReceived,
    ReceivedNotSent,
    Complete,
}

impl HandshakeState {
    /// Records that our handshake went out.
    pub fn on_sent(&mut self) -> Result<(), PeerError> {
        *self = match self {
            HandshakeState::None => HandshakeState::SentNotReceived,
            HandshakeState::ReceivedNotSent => HandshakeState::Complete,
            _ => {
                return Err(PeerError::ProtocolSequence(
                    "handshake sent twice".to_string(),
                ))
            }
        };
        Ok(())
    }

    /// Records that a valid handshake arrived from the peer.
    pub fn on_received(&mut self) -> Result<(), PeerError> {
        *self = match self {
            HandshakeState::None => HandshakeState::ReceivedNotSent,
            HandshakeState::SentNotReceived => HandshakeState::Complete,
            _ => {
                return Err(PeerError::ProtocolSequence(
                    "duplicate handshake".to_string(),
                ))
            }
        };
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        *self == HandshakeState::Complete
    }
}

/// Whether the peer lets us request blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeedingState {
    #[default]
    Choked,
    Unchoked,
}

/// Whether the peer wants pieces from us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeechingState {
    Interested,
    #[default]
    Uninterested,
}

/// Byte counters of one session. Only piece payload is counted.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeerStats {
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_rate: f64,
    pub upload_rate: f64,
}

impl PeerStats {
    pub(crate) fn new(downloaded: u64, uploaded: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let rate = |bytes: u64| if secs > 0.0 { bytes as f64 / secs } else { 0.0 };
        Self {
            downloaded,
            uploaded,
            download_rate: rate(downloaded),
            upload_rate: rate(uploaded),
        }
    }
}

/// Point-in-time view of a session's protocol state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub handshake: HandshakeState,
    pub seeding: SeedingState,
    pub leeching: LeechingState,
    pub remote_id: Option<PeerId>,
    /// Number of pieces the peer has advertised.
    pub remote_pieces: usize,
}
