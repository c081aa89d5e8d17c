//! Framed messages: what travels over the raw connection during the
//! handshake and over logical streams afterwards.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{AsBytes, FromBytes};

use meridian_core::wire::{FrameHeader, MessageKind, FRAME_HEADER_SIZE};

use crate::session::SessionError;

/// A single protocol message: a kind tag and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub content: Bytes,
}

impl Message {
    pub fn new(kind: MessageKind, content: impl Into<Bytes>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(MessageKind::Ok, Bytes::new())
    }

    /// A rejection carrying a human-readable reason.
    pub fn no(reason: impl Into<String>) -> Self {
        Self::new(MessageKind::No, reason.into().into_bytes())
    }

    pub fn json<T: Serialize>(kind: MessageKind, value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_vec(value)?))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.content)
    }

    pub fn is_ok(&self) -> bool {
        self.kind == MessageKind::Ok
    }

    /// The rejection reason, if this is a `No`.
    pub fn rejection(&self) -> Option<String> {
        (self.kind == MessageKind::No).then(|| String::from_utf8_lossy(&self.content).into_owned())
    }
}

/// Read one framed message. A short read is an error, never an empty message.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, SessionError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut head = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut head).await?;

    let header = FrameHeader::read_from(&head[..]).ok_or(SessionError::ShortFrame)?;
    let kind = header.kind()?;

    let mut content = vec![0u8; header.length()];
    reader.read_exact(&mut content).await?;

    Ok(Message::new(kind, content))
}

/// Write one framed message and flush it.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let header = FrameHeader::new(message.kind, message.content.len())?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + message.content.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(&message.content);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
