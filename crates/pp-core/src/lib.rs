//! pp-core — shared types for the storage peer: configuration, wire
//! framing, message payloads and RPC result envelopes.
//! All other crates depend on this one.

pub mod config;
pub mod message;
pub mod rpc;
pub mod wire;

pub use message::{Message, SliceOffset, SpInfo};
pub use rpc::{ResultKind, RpcResult};
pub use wire::{MessageHeader, MessageType, WireError};
