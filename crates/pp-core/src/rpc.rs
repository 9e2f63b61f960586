//! Result envelopes exchanged with the local RPC front end.
//!
//! An `RpcResult` is what the node publishes to a waiting RPC session:
//! "send me this byte range", "here is downloaded data", "tell me the file
//! size". The terminal result structs are single-shot answers polled by the
//! front end.

use serde::{Deserialize, Serialize};

/// Operation-outcome tag of an `RpcResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// Node asks the remote client for a byte range of the file being uploaded.
    UploadData,
    /// Node hands downloaded data to the remote client.
    DownloadOk,
    /// Node asks the remote client for file information (size).
    DlOkAskInfo,
    Success,
    Failed,
    Timeout,
    WrongInput,
    SessionClosing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResult {
    #[serde(rename = "return")]
    pub return_kind: ResultKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset_start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset_end: Option<u64>,
    /// Base64 (standard alphabet) payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl RpcResult {
    pub fn new(return_kind: ResultKind) -> Self {
        Self {
            return_kind,
            offset_start: None,
            offset_end: None,
            file_data: None,
            req_id: None,
            file_name: None,
        }
    }

    pub fn with_range(mut self, start: u64, end: u64) -> Self {
        self.offset_start = Some(start);
        self.offset_end = Some(end);
        self
    }

    pub fn with_req_id(mut self, req_id: impl Into<String>) -> Self {
        self.req_id = Some(req_id.into());
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_file_data(mut self, encoded: String) -> Self {
        self.file_data = Some(encoded);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_hash: String,
    pub file_name: String,
    pub file_size: u64,
    pub create_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListResult {
    pub return_kind: ResultKind,
    pub file_info: Vec<FileInfo>,
    pub total_number: u64,
    pub page_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileShareResult {
    pub return_kind: ResultKind,
    pub share_link: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearExpiredShareLinksResult {
    pub return_kind: ResultKind,
    pub cleared: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OzoneResult {
    pub return_kind: ResultKind,
    pub ozone: String,
    pub sequence_number: String,
}
