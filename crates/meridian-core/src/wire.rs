//! Meridian wire format: the bytes every connection starts with and the
//! frame that carries every message afterwards.
//!
//! These types ARE the protocol. Every field, every width and every byte
//! order is part of the wire format; changing anything here is a breaking
//! change for every peer on the network.
//!
//! Multi-byte integers are little-endian on the wire regardless of host.
//! Types are #[repr(C, packed)] with zerocopy derives for allocation-free
//! encoding. There is no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Preamble ──────────────────────────────────────────────────────────────────

/// Protocol identifier, written first on every new transport connection.
pub const PROTOCOL_MAGIC: u16 = 0x7a66;

/// Protocol version. A receiver seeing any other value drops the connection.
pub const PROTOCOL_VERSION: u16 = 0;

/// Identification preamble: `(magic, version)`.
///
/// Written unconditionally by the dialing side before any handshake message.
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Preamble {
    pub magic: U16<LittleEndian>,
    pub version: U16<LittleEndian>,
}

assert_eq_size!(Preamble, [u8; 4]);

impl Preamble {
    /// The preamble this build speaks.
    pub fn current() -> Self {
        Self {
            magic: U16::new(PROTOCOL_MAGIC),
            version: U16::new(PROTOCOL_VERSION),
        }
    }

    pub fn magic(&self) -> u16 {
        let magic = self.magic;
        magic.get()
    }

    pub fn version(&self) -> u16 {
        let version = self.version;
        version.get()
    }

    /// Reject anything that is not exactly our magic and version.
    pub fn check(&self) -> Result<(), WireError> {
        if self.magic() != PROTOCOL_MAGIC {
            return Err(WireError::BadMagic(self.magic()));
        }
        if self.version() != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(self.version()));
        }
        Ok(())
    }
}

// ── Message Frame ─────────────────────────────────────────────────────────────

/// Header preceding every message payload.
///
/// Wire size: 6 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// `MessageKind` discriminant.
    pub kind: u8,

    /// Reserved, must be zero.
    pub flags: u8,

    /// Payload length in bytes, not including this header.
    pub length: U32<LittleEndian>,
}

assert_eq_size!(FrameHeader, [u8; 6]);

pub const FRAME_HEADER_SIZE: usize = std::mem::size_of::<FrameHeader>();

impl FrameHeader {
    pub fn new(kind: MessageKind, length: usize) -> Result<Self, WireError> {
        if length > MAX_MESSAGE_SIZE {
            return Err(WireError::MessageTooLarge(length));
        }
        Ok(Self {
            kind: kind.into(),
            flags: 0,
            length: U32::new(length as u32),
        })
    }

    pub fn length(&self) -> usize {
        let length = self.length;
        length.get() as usize
    }

    /// Validate the header and resolve its message kind.
    pub fn kind(&self) -> Result<MessageKind, WireError> {
        if self.flags != 0 {
            return Err(WireError::ReservedFlagsSet(self.flags));
        }
        if self.length() > MAX_MESSAGE_SIZE {
            return Err(WireError::MessageTooLarge(self.length()));
        }
        MessageKind::try_from(self.kind)
    }
}

// ── Message Kinds ─────────────────────────────────────────────────────────────

/// Every message type a peer may send.
///
/// The first five belong to the handshake; the rest are requests and
/// replies exchanged on logical streams once a session is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Ok = 0x00,
    No = 0x01,
    Header = 0x02,
    Challenge = 0x03,
    Signature = 0x04,

    Announce = 0x10,
    Query = 0x11,
    FindClosest = 0x12,
    Search = 0x13,
    Recent = 0x14,
    Popular = 0x15,
    HashList = 0x16,
    Piece = 0x17,
    AddPeer = 0x18,
    Ping = 0x19,
    Pong = 0x1a,
    Post = 0x1b,
}

impl TryFrom<u8> for MessageKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MessageKind::*;
        Result::Ok(match value {
            0x00 => Ok,
            0x01 => No,
            0x02 => Header,
            0x03 => Challenge,
            0x04 => Signature,
            0x10 => Announce,
            0x11 => Query,
            0x12 => FindClosest,
            0x13 => Search,
            0x14 => Recent,
            0x15 => Popular,
            0x16 => HashList,
            0x17 => Piece,
            0x18 => AddPeer,
            0x19 => Ping,
            0x1a => Pong,
            0x1b => Post,
            other => return Err(WireError::UnknownKind(other)),
        })
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        kind as u8
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Maximum message payload. Larger frames are a protocol error.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Random challenge length used during the handshake.
pub const CHALLENGE_SIZE: usize = 32;

/// Default TCP port peers listen on.
pub const DEFAULT_PORT: u16 = 5050;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("bad protocol magic: 0x{0:04x}")]
    BadMagic(u16),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("unknown message kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("message length {0} exceeds maximum {}", MAX_MESSAGE_SIZE)]
    MessageTooLarge(usize),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
