use super::error::PeerError;
use super::peer_id::PeerId;
use crate::constants::{HANDSHAKE_LEN, MAX_MESSAGE_SIZE, MAX_REQUEST_LENGTH, PROTOCOL};
use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            _ => Err(PeerError::InvalidMessageId(value)),
        }
    }
}

impl MessageId {
    /// Whether a frame with this id may declare `length` (id byte plus
    /// payload).
    fn accepts_length(self, length: usize) -> bool {
        match self {
            MessageId::Choke
            | MessageId::Unchoke
            | MessageId::Interested
            | MessageId::NotInterested => length == 1,
            MessageId::Have => length == 5,
            MessageId::Bitfield => length >= 1,
            MessageId::Request | MessageId::Cancel => length == 13,
            MessageId::Piece => (9..=9 + MAX_REQUEST_LENGTH as usize).contains(&length),
            MessageId::Port => length == 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    /// Creates a handshake with all reserved bits cleared.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            info_hash,
            peer_id,
            reserved: [0u8; 8],
        }
    }

    pub fn with_extended_messaging(mut self) -> Self {
        self.reserved[5] |= 0x10;
        self
    }

    pub fn with_fast_peer(mut self) -> Self {
        self.reserved[7] |= 0x04;
        self
    }

    pub fn supports_extended_messaging(&self) -> bool {
        (self.reserved[5] & 0x10) != 0
    }

    pub fn supports_fast_peer(&self) -> bool {
        (self.reserved[7] & 0x04) != 0
    }

    /// Checks a received handshake against the local transfer.
    pub fn validate(&self, info_hash: &[u8; 20], our_peer_id: &[u8; 20]) -> Result<(), PeerError> {
        if &self.info_hash != info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
        if PeerId(self.peer_id).is_empty() {
            return Err(PeerError::InvalidHandshake("empty peer id".into()));
        }
        if &self.peer_id == our_peer_id {
            return Err(PeerError::SelfConnection);
        }
        Ok(())
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(PeerError::InvalidHandshake("too short".into()));
        }

        if data[0] as usize != PROTOCOL.len() || &data[1..20] != PROTOCOL {
            return Err(PeerError::InvalidHandshake("unknown protocol".into()));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake(Handshake),
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
}

/// Result of [`Message::try_decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A whole message was decoded and removed from the buffer.
    Message(Message),
    /// The buffer holds a valid prefix of a longer message. Nothing was
    /// consumed.
    Incomplete,
    /// The buffer does not start with any valid message. Nothing was
    /// consumed.
    Invalid,
}

/// What the bytes at the front of a buffer look like.
enum Frame {
    Handshake,
    KeepAlive,
    Message(MessageId, usize),
    Incomplete,
    Invalid,
}

impl Message {
    /// Size of the encoded message in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Message::Handshake(_) => HANDSHAKE_LEN,
            Message::KeepAlive => 4,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 5,
            Message::Have { .. } => 9,
            Message::Bitfield(bits) => 5 + bits.len(),
            Message::Request { .. } | Message::Cancel { .. } => 17,
            Message::Piece { data, .. } => 13 + data.len(),
            Message::Port(_) => 7,
        }
    }

    /// Appends the wire encoding to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());

        match self {
            Message::Handshake(handshake) => handshake.encode_into(buf),
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(*port);
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decodes one message from the front of `buf`.
    ///
    /// On success the frame is split off the buffer; a piece payload is a
    /// view into the same allocation rather than a copy. On
    /// [`Decoded::Incomplete`] and [`Decoded::Invalid`] the buffer is left
    /// untouched.
    pub fn try_decode(buf: &mut BytesMut) -> Decoded {
        match peek_frame(buf) {
            Frame::Incomplete => Decoded::Incomplete,
            Frame::Invalid => Decoded::Invalid,
            Frame::Handshake => match Handshake::decode(&buf[..HANDSHAKE_LEN]) {
                Ok(handshake) => {
                    buf.advance(HANDSHAKE_LEN);
                    Decoded::Message(Message::Handshake(handshake))
                }
                Err(_) => Decoded::Invalid,
            },
            Frame::KeepAlive => {
                buf.advance(4);
                Decoded::Message(Message::KeepAlive)
            }
            Frame::Message(id, length) => {
                let mut frame = buf.split_to(4 + length).freeze();
                frame.advance(5);
                Decoded::Message(from_payload(id, frame))
            }
        }
    }

    /// Decodes a buffer holding exactly one message.
    pub fn decode(data: Bytes) -> Result<Self, PeerError> {
        let mut buf = BytesMut::from(&data[..]);
        match Self::try_decode(&mut buf) {
            Decoded::Message(message) if buf.is_empty() => Ok(message),
            Decoded::Message(_) => Err(PeerError::InvalidMessage("trailing bytes".into())),
            Decoded::Incomplete => Err(PeerError::InvalidMessage("incomplete message".into())),
            Decoded::Invalid => match data.get(4) {
                Some(&id) if MessageId::try_from(id).is_err() => {
                    Err(PeerError::InvalidMessageId(id))
                }
                _ => Err(PeerError::InvalidMessage("invalid frame".into())),
            },
        }
    }
}

/// Classifies the bytes at the front of `buf` from the header alone, so
/// garbage is rejected without waiting for a bogus length to fill up.
fn peek_frame(buf: &[u8]) -> Frame {
    if buf.is_empty() {
        return Frame::Incomplete;
    }

    if buf[0] as usize == PROTOCOL.len() {
        let available = buf.len().min(1 + PROTOCOL.len());
        if buf[1..available] == PROTOCOL[..available - 1] {
            return if buf.len() < HANDSHAKE_LEN {
                Frame::Incomplete
            } else {
                Frame::Handshake
            };
        }
    }

    if buf.len() < 4 {
        return Frame::Incomplete;
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length == 0 {
        return Frame::KeepAlive;
    }
    if length > MAX_MESSAGE_SIZE {
        return Frame::Invalid;
    }
    if buf.len() < 5 {
        return Frame::Incomplete;
    }

    let Ok(id) = MessageId::try_from(buf[4]) else {
        return Frame::Invalid;
    };
    if !id.accepts_length(length) {
        return Frame::Invalid;
    }

    if buf.len() < 4 + length {
        Frame::Incomplete
    } else {
        Frame::Message(id, length)
    }
}

/// Builds a message from a payload whose length `peek_frame` has already
/// checked against `id`.
fn from_payload(id: MessageId, mut frame: Bytes) -> Message {
    match id {
        MessageId::Choke => Message::Choke,
        MessageId::Unchoke => Message::Unchoke,
        MessageId::Interested => Message::Interested,
        MessageId::NotInterested => Message::NotInterested,
        MessageId::Have => Message::Have {
            piece: frame.get_u32(),
        },
        MessageId::Bitfield => Message::Bitfield(frame),
        MessageId::Request => Message::Request {
            index: frame.get_u32(),
            begin: frame.get_u32(),
            length: frame.get_u32(),
        },
        MessageId::Piece => {
            let index = frame.get_u32();
            let begin = frame.get_u32();
            Message::Piece {
                index,
                begin,
                data: frame,
            }
        }
        MessageId::Cancel => Message::Cancel {
            index: frame.get_u32(),
            begin: frame.get_u32(),
            length: frame.get_u32(),
        },
        MessageId::Port => Message::Port(frame.get_u16()),
    }
}
