//! Async stream framing for tagged messages.
//!
//! There is no length prefix on the wire: the tag byte alone decides how many
//! payload bytes follow, so a reader must consume exactly that many before the
//! next tag. An unknown tag is reported as `ProtocolError::UnknownTag` with the
//! stream left positioned right after the tag byte.

use crate::{Message, ProtocolError, Tag};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads one tag byte and its fixed-size payload.
///
/// A clean close before the tag surfaces as an `Io` error of kind
/// `UnexpectedEof`, the same as a close in the middle of a payload.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let tag = Tag::try_from(reader.read_u8().await?)?;

    let mut payload = vec![0u8; tag.payload_len()];
    reader.read_exact(&mut payload).await?;

    Message::decode(tag, &payload)
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = message.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
