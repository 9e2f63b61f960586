//! File RPC bridge: synchronous-looking file operations for the local RPC
//! front end, built on correlation namespaces.
//!
//! The front end holds a waiter on `file_events` (or `slice_events`) for its
//! session key and reacts to what the node publishes there: an `UploadData`
//! request means "push me this byte range" (answered through
//! `send_file_data_back`), `DownloadOk` carries downloaded bytes (answered
//! with `set_download_slice_done`), `DlOkAskInfo` asks for the file size
//! (answered with `set_remote_file_info`).
//!
//! Every wait uses the same process-wide budget. Chunked fetches restart
//! that budget for every chunk, so a slow transfer that keeps making
//! progress is never cut off, while a stalled one fails after one interval.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use pp_core::rpc::{
    ClearExpiredShareLinksResult, FileListResult, FileShareResult, OzoneResult, ResultKind,
    RpcResult,
};
use pp_core::wire::MAX_PAYLOAD;
use pp_core::SliceOffset;

use crate::correlation::{Correlation, CorrelationError, Waiter};
use crate::result_cache::ResultCache;

/// Chunks that may queue up for one fetch before further pushes are dropped.
pub const UPLOAD_CHAN_BUFFER: usize = 5;

/// Largest byte range one fetch may ask for. A slice has to fit in a frame.
pub const MAX_SLICE_LEN: u64 = MAX_PAYLOAD as u64;

/// Key for a file-level operation: file hash + request id.
pub fn file_key(file_hash: &str, req_id: &str) -> String {
    format!("{file_hash}{req_id}")
}

/// Key for a slice-level operation: slice hash + request id.
pub fn slice_key(slice_hash: &str, req_id: &str) -> String {
    format!("{slice_hash}{req_id}")
}

/// Key for a per-wallet query: wallet address + request id.
pub fn wallet_key(wallet_address: &str, req_id: &str) -> String {
    format!("{wallet_address}{req_id}")
}

/// A file whose bytes live with the RPC client rather than on local disk.
#[derive(Debug, Clone)]
struct RemoteFile {
    path: PathBuf,
    size: u64,
}

pub struct FileRpc {
    wait_timeout: Duration,

    file_events: Correlation<RpcResult>,
    slice_events: Correlation<RpcResult>,
    upload_data: Correlation<Bytes>,
    download_done: Correlation<bool>,
    signatures: Correlation<Vec<u8>>,
    file_info: Correlation<u64>,

    closing: DashMap<String, bool>,
    remote_files: DashMap<String, RemoteFile>,

    file_lists: ResultCache<FileListResult>,
    file_shares: ResultCache<FileShareResult>,
    cleared_share_links: ResultCache<ClearExpiredShareLinksResult>,
    ozone: ResultCache<OzoneResult>,

    // One outbound fetch at a time, one inbound delivery at a time.
    upload_lock: Mutex<()>,
    download_lock: Mutex<()>,
}

impl FileRpc {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            wait_timeout,
            file_events: Correlation::new("file_event"),
            slice_events: Correlation::new("slice_event"),
            upload_data: Correlation::with_capacity("upload_data", UPLOAD_CHAN_BUFFER),
            download_done: Correlation::new("download_done"),
            signatures: Correlation::new("signature"),
            file_info: Correlation::new("file_info"),
            closing: DashMap::new(),
            remote_files: DashMap::new(),
            file_lists: ResultCache::new(),
            file_shares: ResultCache::new(),
            cleared_share_links: ResultCache::new(),
            ozone: ResultCache::new(),
            upload_lock: Mutex::new(()),
            download_lock: Mutex::new(()),
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    // ── Namespaces ───────────────────────────────────────────────────────────

    /// Results published to an RPC session, keyed by file hash (+ request id).
    pub fn file_events(&self) -> &Correlation<RpcResult> {
        &self.file_events
    }

    /// Results published to an RPC slice session, keyed by slice hash + request id.
    pub fn slice_events(&self) -> &Correlation<RpcResult> {
        &self.slice_events
    }

    /// Raw data chunks pushed by the RPC client, keyed by file hash.
    pub fn upload_data(&self) -> &Correlation<Bytes> {
        &self.upload_data
    }

    pub fn download_done(&self) -> &Correlation<bool> {
        &self.download_done
    }

    pub fn signatures(&self) -> &Correlation<Vec<u8>> {
        &self.signatures
    }

    pub fn file_info(&self) -> &Correlation<u64> {
        &self.file_info
    }

    pub fn file_lists(&self) -> &ResultCache<FileListResult> {
        &self.file_lists
    }

    /// Filled by the RPC front end itself; no SP message lands here.
    pub fn file_shares(&self) -> &ResultCache<FileShareResult> {
        &self.file_shares
    }

    /// Filled by the RPC front end itself; no SP message lands here.
    pub fn cleared_share_links(&self) -> &ResultCache<ClearExpiredShareLinksResult> {
        &self.cleared_share_links
    }

    pub fn ozone(&self) -> &ResultCache<OzoneResult> {
        &self.ozone
    }

    // ── Upload: pulling bytes from the RPC client ───────────────────────────

    /// Fetch `offset` of the file `hash` from the RPC client into memory.
    pub async fn get_remote_file_data(
        &self,
        hash: &str,
        offset: Option<SliceOffset>,
    ) -> Result<Vec<u8>, RpcError> {
        let offset = validate_offset(offset)?;
        let _guard = self.upload_lock.lock().await;

        let mut chunks = self.request_upload_data(hash, offset);
        let mut data = vec![0u8; offset.len() as usize];
        let mut read = 0usize;

        while read < data.len() {
            let chunk = chunks.next(self.wait_timeout).await?;
            let n = chunk.len().min(data.len() - read);
            data[read..read + n].copy_from_slice(&chunk[..n]);
            read += chunk.len();
            tracing::trace!(
                file_hash = hash,
                offset_start = offset.slice_offset_start,
                received = read,
                "sub-slice received"
            );
        }

        Ok(data)
    }

    /// Fetch `offset` of the file `hash` from the RPC client, spooling each
    /// chunk into `tmp_path` at its position within the slice.
    pub async fn cache_remote_file_data(
        &self,
        hash: &str,
        offset: Option<SliceOffset>,
        tmp_path: &Path,
    ) -> Result<(), RpcError> {
        let offset = validate_offset(offset)?;
        let _guard = self.upload_lock.lock().await;

        let io_err = |source| RpcError::Io {
            path: tmp_path.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp_path)
            .await
            .map_err(io_err)?;

        let mut chunks = self.request_upload_data(hash, offset);
        let total = offset.len();
        let mut read = 0u64;

        while read < total {
            let chunk = chunks.next(self.wait_timeout).await?;
            file.seek(SeekFrom::Start(read)).await.map_err(io_err)?;
            file.write_all(&chunk).await.map_err(io_err)?;
            read += chunk.len() as u64;
        }
        file.flush().await.map_err(io_err)?;

        tracing::debug!(
            file_hash = hash,
            bytes = total,
            path = %tmp_path.display(),
            "remote slice cached"
        );
        Ok(())
    }

    /// Feed a chunk pushed by the RPC client to the fetch waiting on `hash`.
    pub fn send_file_data_back(&self, hash: &str, content: Bytes) -> bool {
        self.upload_data.publish(hash, content)
    }

    // Subscribe first so the client's first push can't beat the waiter.
    fn request_upload_data(&self, hash: &str, offset: SliceOffset) -> Waiter<Bytes> {
        let chunks = self.upload_data.subscribe(hash);
        let request = RpcResult::new(ResultKind::UploadData)
            .with_range(offset.slice_offset_start, offset.slice_offset_end);
        if !self.file_events.publish(hash, request) {
            tracing::debug!(file_hash = hash, "no rpc session listening for upload request");
        }
        chunks
    }

    // ── Download: pushing bytes to the RPC client ───────────────────────────

    /// Deliver downloaded bytes to whichever session is waiting: the slice
    /// session under `slice_key` if one is registered, else the file session.
    pub async fn save_remote_file_slice_data(
        &self,
        slice_key: &str,
        file_key: &str,
        file_name: &str,
        data: &[u8],
        offset: u64,
    ) -> Result<(), RpcError> {
        if self.slice_events.is_subscribed(slice_key) {
            self.save_remote_slice_data(slice_key, file_name, data, offset)
                .await
        } else {
            self.save_remote_file_data(file_key, file_name, data, offset)
                .await
        }
    }

    /// Hand `data` (located at `offset` in the file) to the RPC file session
    /// `key` and wait until the client confirms receipt.
    pub async fn save_remote_file_data(
        &self,
        key: &str,
        file_name: &str,
        data: &[u8],
        offset: u64,
    ) -> Result<(), RpcError> {
        if data.is_empty() {
            return Err(RpcError::InvalidInput("empty download data"));
        }
        if self.take_closing(key) {
            tracing::info!(key, "download session closing, delivery aborted");
            return Err(RpcError::SessionClosing(key.to_string()));
        }

        let _guard = self.download_lock.lock().await;
        let done = self.download_done.subscribe(key);
        self.file_events
            .publish(key, download_ok(file_name, data, offset));
        self.wait_download_done(done).await
    }

    /// Slice-session variant of `save_remote_file_data`.
    pub async fn save_remote_slice_data(
        &self,
        key: &str,
        file_name: &str,
        data: &[u8],
        offset: u64,
    ) -> Result<(), RpcError> {
        if data.is_empty() {
            return Err(RpcError::InvalidInput("empty download data"));
        }
        if self.take_closing(key) {
            return Err(RpcError::SessionClosing(key.to_string()));
        }

        let done = self.download_done.subscribe(key);
        self.slice_events
            .publish(key, download_ok(file_name, data, offset));
        self.wait_download_done(done).await
    }

    /// The RPC client confirms it received the last delivery for `key`.
    pub fn set_download_slice_done(&self, key: &str) -> bool {
        self.download_done.publish(key, true)
    }

    /// Ask for the delivery sequence under `key` to stop at its next step.
    ///
    /// Only a session that is still listening can be closed; returns false
    /// otherwise. Flags left by sessions that stopped listening without
    /// another delivery are pruned here, so at most one flag per live
    /// session is kept.
    pub fn close_download_session(&self, key: &str) -> bool {
        self.closing.retain(|k, _| self.is_listening(k));
        if !self.is_listening(key) {
            tracing::debug!(key, "close for a download session that is not listening");
            return false;
        }
        self.closing.insert(key.to_string(), true);
        true
    }

    fn is_listening(&self, key: &str) -> bool {
        self.file_events.is_subscribed(key) || self.slice_events.is_subscribed(key)
    }

    fn take_closing(&self, key: &str) -> bool {
        self.closing.remove(key).map(|(_, v)| v).unwrap_or(false)
    }

    async fn wait_download_done(&self, done: Waiter<bool>) -> Result<(), RpcError> {
        let key = done.key().to_string();
        match done.wait(self.wait_timeout).await? {
            true => Ok(()),
            false => Err(RpcError::InvalidState(key)),
        }
    }

    // ── File info / signatures ──────────────────────────────────────────────

    /// Ask the RPC client for the size of the file behind `key`.
    ///
    /// Returns 0 when no answer arrives in time; 0 means "unknown", never a
    /// real size.
    pub async fn get_remote_file_info(&self, key: &str, req_id: &str) -> u64 {
        let answer = self.file_info.subscribe(key);
        self.file_events
            .publish(key, RpcResult::new(ResultKind::DlOkAskInfo).with_req_id(req_id));
        match answer.wait(self.wait_timeout).await {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!(key, error = %e, "no file info from rpc client");
                0
            }
        }
    }

    pub fn set_remote_file_info(&self, key: &str, size: u64) -> bool {
        self.file_info.publish(key, size)
    }

    /// Wait for the RPC client to supply a signature under `key`.
    pub async fn get_signature_from_remote(&self, key: &str) -> Option<Vec<u8>> {
        match self.signatures.wait_for(key, self.wait_timeout).await {
            Ok(sig) => Some(sig),
            Err(e) => {
                tracing::warn!(key, error = %e, "no signature from rpc client");
                None
            }
        }
    }

    pub fn set_signature(&self, key: &str, sig: Vec<u8>) -> bool {
        self.signatures.publish(key, sig)
    }

    // ── Remote file table ───────────────────────────────────────────────────

    /// Record that the file `hash` is served by the RPC client.
    pub fn save_remote_file_hash(&self, hash: &str, file_path: impl Into<PathBuf>, size: u64) {
        self.remote_files.insert(
            hash.to_string(),
            RemoteFile {
                path: file_path.into(),
                size,
            },
        );
    }

    pub fn is_file_rpc_remote(&self, hash: &str) -> bool {
        self.remote_files.contains_key(hash)
    }

    /// Size of a remote file, 0 if unknown.
    pub fn get_remote_file_size(&self, hash: &str) -> u64 {
        self.remote_files.get(hash).map(|f| f.size).unwrap_or(0)
    }

    pub fn remote_file_path(&self, hash: &str) -> Option<PathBuf> {
        self.remote_files.get(hash).map(|f| f.path.clone())
    }

    pub fn clean_file_hash(&self, hash: &str) {
        self.remote_files.remove(hash);
    }
}

fn validate_offset(offset: Option<SliceOffset>) -> Result<SliceOffset, RpcError> {
    let offset = offset.ok_or(RpcError::InvalidInput("missing slice offset"))?;
    if offset.is_empty() {
        return Err(RpcError::InvalidInput("empty slice range"));
    }
    if offset.len() > MAX_SLICE_LEN {
        return Err(RpcError::InvalidInput("slice range too long"));
    }
    Ok(offset)
}

fn download_ok(file_name: &str, data: &[u8], offset: u64) -> RpcResult {
    RpcResult::new(ResultKind::DownloadOk)
        .with_range(offset, offset + data.len() as u64)
        .with_file_data(base64::engine::general_purpose::STANDARD.encode(data))
        .with_file_name(file_name)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("download session {0} is closing")]
    SessionClosing(String),

    #[error(transparent)]
    Timeout(#[from] CorrelationError),

    #[error("download of {0} acknowledged with invalid state")]
    InvalidState(String),

    #[error("temp file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
