use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod framing;

pub use framing::{read_message, write_message};

pub const DEFAULT_PORT: u16 = 12345;
pub const NAME_LEN: usize = 32;

/// Server-assigned peer handle. Numerically equal to the peer's socket
/// handle on the server, so it is only unique among open connections.
pub type ClientId = u32;
pub type GroupId = i32;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message tag 0x{0:02X}")]
    UnknownTag(u8),
    #[error("unexpected {0:?} message")]
    UnexpectedMessage(Tag),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when the underlying stream is gone and nothing more can be read.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtocolError::Io(_) => true,
            ProtocolError::Codec(e) => matches!(**e, bincode::ErrorKind::Io(_)),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Join = 0x01,
    JoinAck = 0x02,
    Greeting = 0x03,
    Position = 0x04,
    Acknowledgment = 0x05,
    NameRequest = 0x06,
    NameReply = 0x07,
    Disconnect = 0x08,
}

impl Tag {
    /// Size in bytes of the payload that follows this tag on the wire.
    pub fn payload_len(self) -> usize {
        match self {
            Tag::Join => 4,
            Tag::JoinAck => 4,
            Tag::Greeting => NAME_LEN,
            Tag::Position => 20,
            Tag::Acknowledgment => 12,
            Tag::NameRequest => 8,
            Tag::NameReply => 8 + NAME_LEN,
            Tag::Disconnect => 4,
        }
    }
}

impl TryFrom<u8> for Tag {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x01 => Ok(Tag::Join),
            0x02 => Ok(Tag::JoinAck),
            0x03 => Ok(Tag::Greeting),
            0x04 => Ok(Tag::Position),
            0x05 => Ok(Tag::Acknowledgment),
            0x06 => Ok(Tag::NameRequest),
            0x07 => Ok(Tag::NameReply),
            0x08 => Ok(Tag::Disconnect),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

/// Fixed-width, NUL-padded peer name.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerName([u8; NAME_LEN]);

impl PeerName {
    /// Builds a name, truncating on a char boundary so that at least one
    /// NUL terminator remains.
    pub fn new(name: &str) -> Self {
        let mut end = name.len().min(NAME_LEN - 1);
        while !name.is_char_boundary(end) {
            end -= 1;
        }

        let mut bytes = [0u8; NAME_LEN];
        bytes[..end].copy_from_slice(&name.as_bytes()[..end]);
        PeerName(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NAME_LEN] {
        &self.0
    }

    pub fn to_string_lossy(&self) -> String {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(NAME_LEN);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl fmt::Debug for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerName({:?})", self.to_string_lossy())
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    pub group: GroupId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinAck {
    pub assigned_id: ClientId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    pub name: PeerName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub origin: ClientId,
    pub sequence: u32,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub origin: ClientId,
    pub destination: ClientId,
    pub sequence: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRequest {
    pub origin: ClientId,
    pub destination: ClientId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameReply {
    pub origin: ClientId,
    pub destination: ClientId,
    pub name: PeerName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
    pub origin: ClientId,
}

/// One tagged wire record: `[tag][fixed-size payload]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Join(Join),
    JoinAck(JoinAck),
    Greeting(Greeting),
    Position(Position),
    Acknowledgment(Acknowledgment),
    NameRequest(NameRequest),
    NameReply(NameReply),
    Disconnect(Disconnect),
}

impl Message {
    pub fn tag(&self) -> Tag {
        match self {
            Message::Join(_) => Tag::Join,
            Message::JoinAck(_) => Tag::JoinAck,
            Message::Greeting(_) => Tag::Greeting,
            Message::Position(_) => Tag::Position,
            Message::Acknowledgment(_) => Tag::Acknowledgment,
            Message::NameRequest(_) => Tag::NameRequest,
            Message::NameReply(_) => Tag::NameReply,
            Message::Disconnect(_) => Tag::Disconnect,
        }
    }

    /// Recipient of a point-to-point message, `None` for everything else.
    pub fn destination(&self) -> Option<ClientId> {
        match self {
            Message::Acknowledgment(m) => Some(m.destination),
            Message::NameRequest(m) => Some(m.destination),
            Message::NameReply(m) => Some(m.destination),
            _ => None,
        }
    }

    /// Encodes the tag byte followed by the little-endian, unpadded payload.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let tag = self.tag();
        let mut buf = Vec::with_capacity(1 + tag.payload_len());
        buf.push(tag as u8);

        match self {
            Message::Join(m) => bincode::serialize_into(&mut buf, m)?,
            Message::JoinAck(m) => bincode::serialize_into(&mut buf, m)?,
            Message::Greeting(m) => bincode::serialize_into(&mut buf, m)?,
            Message::Position(m) => bincode::serialize_into(&mut buf, m)?,
            Message::Acknowledgment(m) => bincode::serialize_into(&mut buf, m)?,
            Message::NameRequest(m) => bincode::serialize_into(&mut buf, m)?,
            Message::NameReply(m) => bincode::serialize_into(&mut buf, m)?,
            Message::Disconnect(m) => bincode::serialize_into(&mut buf, m)?,
        }

        Ok(buf)
    }

    /// Decodes the payload that followed `tag` on the wire.
    pub fn decode(tag: Tag, payload: &[u8]) -> Result<Self, ProtocolError> {
        let message = match tag {
            Tag::Join => Message::Join(bincode::deserialize(payload)?),
            Tag::JoinAck => Message::JoinAck(bincode::deserialize(payload)?),
            Tag::Greeting => Message::Greeting(bincode::deserialize(payload)?),
            Tag::Position => Message::Position(bincode::deserialize(payload)?),
            Tag::Acknowledgment => Message::Acknowledgment(bincode::deserialize(payload)?),
            Tag::NameRequest => Message::NameRequest(bincode::deserialize(payload)?),
            Tag::NameReply => Message::NameReply(bincode::deserialize(payload)?),
            Tag::Disconnect => Message::Disconnect(bincode::deserialize(payload)?),
        };
        Ok(message)
    }
}
