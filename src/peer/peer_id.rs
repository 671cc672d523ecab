use std::fmt;

use rand::Rng as _;

use crate::constants::CLIENT_PREFIX;

/// The 20-byte identifier a client announces in its handshake.
///
/// Generated IDs carry the Azureus-style prefix `-BS0001-` followed by
/// twelve random bytes.
///
/// # Examples
///
/// ```
/// use bitswarm::peer::PeerId;
///
/// let peer_id = PeerId::generate();
/// assert_eq!(peer_id.client_id(), Some("BS0001"));
/// assert!(!peer_id.is_empty());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        let (prefix, random) = id.split_at_mut(CLIENT_PREFIX.len());
        prefix.copy_from_slice(CLIENT_PREFIX);
        rand::rng().fill(random);
        Self(id)
    }

    /// An all-zero ID, which a handshake may not carry.
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 20]
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The six characters between the dashes of an Azureus-style ID.
    pub fn client_id(&self) -> Option<&str> {
        match &self.0[..8] {
            [b'-', client @ .., b'-'] => std::str::from_utf8(client).ok(),
            _ => None,
        }
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(id: [u8; 20]) -> Self {
        Self(id)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client_id() {
            Some(client) => write!(f, "PeerId({})", client),
            None => write!(f, "PeerId({})", self),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|byte| write!(f, "{:02x}", byte))
    }
}
