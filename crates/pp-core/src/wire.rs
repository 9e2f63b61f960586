//! PP wire format: the fixed frame header and message type tags.
//!
//! Every message on a PP connection is a `MessageHeader` followed by
//! `length` bytes of payload. The header is `#[repr(C, packed)]` and uses
//! zerocopy derives, so framing is allocation-free and has no unsafe code.
//! Multi-byte fields are little-endian on the wire; use the accessors
//! rather than reading the packed fields directly.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Frame Header ─────────────────────────────────────────────────────────────

/// Fixed header preceding every framed message.
///
/// Wire size: 17 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct MessageHeader {
    /// Always `FRAME_MAGIC`. Anything else means the stream is out of sync.
    pub magic: u8,

    /// Application version of the sender.
    pub version: u16,

    /// `MessageType` tag of the payload.
    pub msg_type: u16,

    /// Payload length in bytes, not including this header.
    pub length: u32,

    /// Request id echoed by the responder. 0 when unused.
    pub req_id: i64,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(MessageHeader, [u8; 17]);

/// Length of `MessageHeader` on the wire.
pub const HEADER_LEN: usize = 17;

impl MessageHeader {
    pub fn new(version: u16, msg_type: MessageType, length: u32, req_id: i64) -> Self {
        Self {
            magic: FRAME_MAGIC,
            version: version.to_le(),
            msg_type: u16::from(msg_type).to_le(),
            length: length.to_le(),
            req_id: req_id.to_le(),
        }
    }

    /// Parse and validate a header from the first `HEADER_LEN` bytes.
    ///
    /// The type tag is not checked here so a reader can still skip the
    /// payload of a frame it doesn't understand; see `msg_type`.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let header = Self::read_from_prefix(bytes).ok_or(WireError::Truncated(bytes.len()))?;
        if header.magic != FRAME_MAGIC {
            return Err(WireError::BadMagic(header.magic));
        }
        let length = header.length() as usize;
        if length > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(length));
        }
        Ok(header)
    }

    pub fn version(&self) -> u16 {
        u16::from_le(self.version)
    }

    pub fn raw_msg_type(&self) -> u16 {
        u16::from_le(self.msg_type)
    }

    pub fn msg_type(&self) -> Result<MessageType, WireError> {
        MessageType::try_from(self.raw_msg_type())
    }

    pub fn length(&self) -> u32 {
        u32::from_le(self.length)
    }

    pub fn req_id(&self) -> i64 {
        i64::from_le(self.req_id)
    }
}

/// Build a complete frame: header followed by payload.
pub fn encode_frame(
    version: u16,
    msg_type: MessageType,
    req_id: i64,
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }
    let header = MessageHeader::new(version, msg_type, payload.len() as u32, req_id);
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

// ── Message Types ────────────────────────────────────────────────────────────

/// Message type tag carried in `MessageHeader::msg_type`.
///
/// Requests are odd, responses even. Tags are part of the protocol and must
/// never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    ReqGetSpList = 0x0001,
    RspGetSpList = 0x0002,
    ReqLatencyCheck = 0x0003,
    RspLatencyCheck = 0x0004,
    ReqHeartbeat = 0x0005,
    RspHeartbeat = 0x0006,
    ReqGetPpStatus = 0x0007,
    RspGetPpStatus = 0x0008,
    ReqRegisterNewPp = 0x0009,
    RspRegisterNewPp = 0x000a,
    /// Sent by an SP to ask this node to run a latency sweep.
    ReqSpLatencyCheck = 0x000b,
    RspFindMyFileList = 0x0010,
    RspGetOzone = 0x0012,
}

impl MessageType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReqGetSpList => "ReqGetSpList",
            Self::RspGetSpList => "RspGetSpList",
            Self::ReqLatencyCheck => "ReqLatencyCheck",
            Self::RspLatencyCheck => "RspLatencyCheck",
            Self::ReqHeartbeat => "ReqHeartbeat",
            Self::RspHeartbeat => "RspHeartbeat",
            Self::ReqGetPpStatus => "ReqGetPpStatus",
            Self::RspGetPpStatus => "RspGetPpStatus",
            Self::ReqRegisterNewPp => "ReqRegisterNewPp",
            Self::RspRegisterNewPp => "RspRegisterNewPp",
            Self::ReqSpLatencyCheck => "ReqSpLatencyCheck",
            Self::RspFindMyFileList => "RspFindMyFileList",
            Self::RspGetOzone => "RspGetOzone",
        }
    }
}

impl TryFrom<u16> for MessageType {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(Self::ReqGetSpList),
            0x0002 => Ok(Self::RspGetSpList),
            0x0003 => Ok(Self::ReqLatencyCheck),
            0x0004 => Ok(Self::RspLatencyCheck),
            0x0005 => Ok(Self::ReqHeartbeat),
            0x0006 => Ok(Self::RspHeartbeat),
            0x0007 => Ok(Self::ReqGetPpStatus),
            0x0008 => Ok(Self::RspGetPpStatus),
            0x0009 => Ok(Self::ReqRegisterNewPp),
            0x000a => Ok(Self::RspRegisterNewPp),
            0x000b => Ok(Self::ReqSpLatencyCheck),
            0x0010 => Ok(Self::RspFindMyFileList),
            0x0012 => Ok(Self::RspGetOzone),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

impl From<MessageType> for u16 {
    fn from(t: MessageType) -> u16 {
        t as u16
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// First byte of every frame.
pub const FRAME_MAGIC: u8 = 0x5f;

/// Maximum payload size in bytes (16 MiB).
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame truncated: {0} bytes")]
    Truncated(usize),

    #[error("bad frame magic: 0x{0:02x}")]
    BadMagic(u8),

    #[error("unknown message type: 0x{0:04x}")]
    UnknownMessageType(u16),

    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("malformed {msg_type} payload: {reason}")]
    MalformedPayload {
        msg_type: MessageType,
        reason: String,
    },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
