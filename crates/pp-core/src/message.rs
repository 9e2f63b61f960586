//! Decoded message payloads.
//!
//! Each wire `MessageType` maps to exactly one `Message` variant carrying its
//! payload struct. Payloads travel as JSON after the frame header.

use serde::{Deserialize, Serialize};

use crate::rpc::{FileListResult, OzoneResult};
use crate::wire::{MessageType, WireError};

/// Outcome reported by an SP in a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultState {
    #[default]
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResponseResult {
    pub state: ResultState,
    #[serde(default)]
    pub msg: String,
}

impl ResponseResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self {
            state: ResultState::Failed,
            msg: msg.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == ResultState::Success
    }
}

/// One supervising peer as distributed in an SP list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpInfo {
    pub p2p_address: String,
    pub p2p_public_key: String,
    pub network_address: String,
}

/// Byte range of a slice, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceOffset {
    pub slice_offset_start: u64,
    pub slice_offset_end: u64,
}

impl SliceOffset {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            slice_offset_start: start,
            slice_offset_end: end,
        }
    }

    /// Range length. Zero for empty or inverted ranges.
    pub fn len(&self) -> u64 {
        self.slice_offset_end.saturating_sub(self.slice_offset_start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqGetSpList {
    pub p2p_address: String,
    pub wallet_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RspGetSpList {
    pub result: ResponseResult,
    pub sp_list: Vec<SpInfo>,
}

/// Latency probe. `ping_time` is the sender's clock in unix nanoseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqLatencyCheck {
    pub p2p_address_pp: String,
    pub network_address_sp: String,
    pub ping_time: i64,
}

/// Echo of a latency probe; `ping_time` is copied from the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RspLatencyCheck {
    pub p2p_address_pp: String,
    pub network_address_sp: String,
    pub ping_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub p2p_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqGetPpStatus {
    pub p2p_address: String,
    /// Ask the SP to also push a fresh PP list.
    pub init_pp_list: bool,
}

/// Registration state of this node as seen by the SP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PpState {
    Offline,
    Online,
    Suspended,
    Unregistered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RspGetPpStatus {
    pub result: ResponseResult,
    pub state: PpState,
    pub is_active: bool,
    pub init_pp_list: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqRegisterNewPp {
    pub p2p_address: String,
    pub p2p_public_key: String,
    pub wallet_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RspRegisterNewPp {
    pub result: ResponseResult,
    /// Set on failure when the node was registered before.
    #[serde(default)]
    pub already_pp: bool,
}

/// File-list answer, keyed back to the requester by wallet + request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RspFindMyFileList {
    pub wallet_address: String,
    pub req_id: String,
    pub result: FileListResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RspGetOzone {
    pub wallet_address: String,
    pub req_id: String,
    pub result: OzoneResult,
}

/// A decoded inbound or outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ReqGetSpList(ReqGetSpList),
    RspGetSpList(RspGetSpList),
    ReqLatencyCheck(ReqLatencyCheck),
    RspLatencyCheck(RspLatencyCheck),
    ReqHeartbeat(Heartbeat),
    RspHeartbeat(Heartbeat),
    ReqGetPpStatus(ReqGetPpStatus),
    RspGetPpStatus(RspGetPpStatus),
    ReqRegisterNewPp(ReqRegisterNewPp),
    RspRegisterNewPp(RspRegisterNewPp),
    ReqSpLatencyCheck,
    RspFindMyFileList(RspFindMyFileList),
    RspGetOzone(RspGetOzone),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::ReqGetSpList(_) => MessageType::ReqGetSpList,
            Message::RspGetSpList(_) => MessageType::RspGetSpList,
            Message::ReqLatencyCheck(_) => MessageType::ReqLatencyCheck,
            Message::RspLatencyCheck(_) => MessageType::RspLatencyCheck,
            Message::ReqHeartbeat(_) => MessageType::ReqHeartbeat,
            Message::RspHeartbeat(_) => MessageType::RspHeartbeat,
            Message::ReqGetPpStatus(_) => MessageType::ReqGetPpStatus,
            Message::RspGetPpStatus(_) => MessageType::RspGetPpStatus,
            Message::ReqRegisterNewPp(_) => MessageType::ReqRegisterNewPp,
            Message::RspRegisterNewPp(_) => MessageType::RspRegisterNewPp,
            Message::ReqSpLatencyCheck => MessageType::ReqSpLatencyCheck,
            Message::RspFindMyFileList(_) => MessageType::RspFindMyFileList,
            Message::RspGetOzone(_) => MessageType::RspGetOzone,
        }
    }

    /// Serialize the payload (without header).
    pub fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        let msg_type = self.message_type();
        let encoded = match self {
            Message::ReqGetSpList(p) => serde_json::to_vec(p),
            Message::RspGetSpList(p) => serde_json::to_vec(p),
            Message::ReqLatencyCheck(p) => serde_json::to_vec(p),
            Message::RspLatencyCheck(p) => serde_json::to_vec(p),
            Message::ReqHeartbeat(p) | Message::RspHeartbeat(p) => serde_json::to_vec(p),
            Message::ReqGetPpStatus(p) => serde_json::to_vec(p),
            Message::RspGetPpStatus(p) => serde_json::to_vec(p),
            Message::ReqRegisterNewPp(p) => serde_json::to_vec(p),
            Message::RspRegisterNewPp(p) => serde_json::to_vec(p),
            Message::ReqSpLatencyCheck => Ok(Vec::new()),
            Message::RspFindMyFileList(p) => serde_json::to_vec(p),
            Message::RspGetOzone(p) => serde_json::to_vec(p),
        };
        encoded.map_err(|e| WireError::MalformedPayload {
            msg_type,
            reason: e.to_string(),
        })
    }

    /// Decode a payload for the given message type.
    pub fn decode(msg_type: MessageType, payload: &[u8]) -> Result<Self, WireError> {
        fn parse<T: serde::de::DeserializeOwned>(
            msg_type: MessageType,
            payload: &[u8],
        ) -> Result<T, WireError> {
            serde_json::from_slice(payload).map_err(|e| WireError::MalformedPayload {
                msg_type,
                reason: e.to_string(),
            })
        }

        let msg = match msg_type {
            MessageType::ReqGetSpList => Message::ReqGetSpList(parse(msg_type, payload)?),
            MessageType::RspGetSpList => Message::RspGetSpList(parse(msg_type, payload)?),
            MessageType::ReqLatencyCheck => Message::ReqLatencyCheck(parse(msg_type, payload)?),
            MessageType::RspLatencyCheck => Message::RspLatencyCheck(parse(msg_type, payload)?),
            MessageType::ReqHeartbeat => Message::ReqHeartbeat(parse(msg_type, payload)?),
            MessageType::RspHeartbeat => Message::RspHeartbeat(parse(msg_type, payload)?),
            MessageType::ReqGetPpStatus => Message::ReqGetPpStatus(parse(msg_type, payload)?),
            MessageType::RspGetPpStatus => Message::RspGetPpStatus(parse(msg_type, payload)?),
            MessageType::ReqRegisterNewPp => Message::ReqRegisterNewPp(parse(msg_type, payload)?),
            MessageType::RspRegisterNewPp => Message::RspRegisterNewPp(parse(msg_type, payload)?),
            MessageType::ReqSpLatencyCheck => Message::ReqSpLatencyCheck,
            MessageType::RspFindMyFileList => {
                Message::RspFindMyFileList(parse(msg_type, payload)?)
            }
            MessageType::RspGetOzone => Message::RspGetOzone(parse(msg_type, payload)?),
        };
        Ok(msg)
    }
}
