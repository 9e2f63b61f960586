//! Peer connections: cloneable send handles plus the on-demand registry
//! used to reach storage peers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc};

use pp_core::wire::encode_frame;
use pp_core::{Message, WireError};

struct Inner {
    addr: String,
    app_ver: u16,
    tx: mpsc::UnboundedSender<Bytes>,
    alive: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

/// Handle to one peer connection.
///
/// `send` encodes and enqueues a frame; a writer task owns the socket.
/// Clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(addr: impl Into<String>, app_ver: u16, tx: mpsc::UnboundedSender<Bytes>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                addr: addr.into(),
                app_ver,
                tx,
                alive: AtomicBool::new(true),
                shutdown,
            }),
        }
    }

    /// A connection with no socket behind it. Frames passed to `send` come
    /// out of the returned receiver.
    pub fn pair(addr: impl Into<String>, app_ver: u16) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(addr, app_ver, tx), rx)
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn app_ver(&self) -> u16 {
        self.inner.app_ver
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire) && !self.inner.tx.is_closed()
    }

    /// Encode `msg` and queue it for the writer.
    pub fn send(&self, msg: &Message, req_id: i64) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed(self.inner.addr.clone()));
        }
        let payload = msg.encode_payload()?;
        let frame = encode_frame(self.inner.app_ver, msg.message_type(), req_id, &payload)?;
        self.inner.tx.send(Bytes::from(frame)).map_err(|_| {
            self.inner.alive.store(false, Ordering::Release);
            TransportError::Closed(self.inner.addr.clone())
        })?;
        tracing::trace!(addr = %self.inner.addr, msg_type = %msg.message_type(), req_id, "frame queued");
        Ok(())
    }

    /// Stop the reader and writer tasks. Idempotent.
    pub fn close(&self) {
        if self.inner.alive.swap(false, Ordering::AcqRel) {
            let _ = self.inner.shutdown.send(());
            tracing::debug!(addr = %self.inner.addr, "connection closed");
        }
    }

    /// Receiver that fires when `close` is called. Subscribe before the
    /// connection is handed out.
    pub(crate) fn closed(&self) -> broadcast::Receiver<()> {
        self.inner.shutdown.subscribe()
    }

    /// Whether two handles refer to the same underlying connection.
    pub fn same(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.inner.addr)
            .field("alive", &self.is_alive())
            .finish()
    }
}

// ── Connector ────────────────────────────────────────────────────────────────

/// Opens outbound connections. Implemented over TCP for the daemon and by
/// in-memory fakes in tests.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, Result<Connection, TransportError>>;
}

// ── Connection registry ──────────────────────────────────────────────────────

/// Live connections to supervising and storage peers, opened on first use
/// and reused afterwards.
pub struct ConnectionRegistry {
    connections: DashMap<String, Connection>,
    connector: Arc<dyn Connector>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connections: DashMap::new(),
            connector,
        }
    }

    /// Return the live connection to `addr`, connecting if there is none.
    pub async fn get_or_connect(&self, addr: &str) -> Result<Connection, TransportError> {
        let existing = self.connections.get(addr).map(|c| c.clone());
        if let Some(conn) = existing {
            if conn.is_alive() {
                return Ok(conn);
            }
            self.connections.remove_if(addr, |_, c| c.same(&conn));
        }

        let conn = self.connector.connect(addr).await?;
        tracing::info!(addr, "peer connected");
        // Two concurrent callers may both connect; keep whichever landed first.
        let kept = self
            .connections
            .entry(addr.to_string())
            .or_insert_with(|| conn.clone())
            .clone();
        if !kept.same(&conn) {
            conn.close();
        }
        Ok(kept)
    }

    /// Dial `addr` without registering the connection. Used for short-lived
    /// connections such as latency probes; `adopt` registers one later.
    pub async fn open(&self, addr: &str) -> Result<Connection, TransportError> {
        self.connector.connect(addr).await
    }

    /// Register `conn` as the connection to its address. A different live
    /// connection already registered there is closed.
    pub fn adopt(&self, conn: Connection) {
        if let Some(old) = self.connections.insert(conn.addr().to_string(), conn.clone()) {
            if !old.same(&conn) {
                old.close();
            }
        }
    }

    /// Close `conn` and forget it, unless a newer connection has already
    /// replaced it in the registry.
    pub fn discard(&self, conn: &Connection) {
        conn.close();
        self.connections.remove_if(conn.addr(), |_, c| c.same(conn));
    }

    pub fn is_connected(&self, addr: &str) -> bool {
        self.connections
            .get(addr)
            .map(|c| c.is_alive())
            .unwrap_or(false)
    }

    /// Close and forget the connection to `addr`.
    pub fn remove(&self, addr: &str) {
        if let Some((_, conn)) = self.connections.remove(addr) {
            conn.close();
        }
    }

    /// Send `msg` to the storage peer at `addr`, connecting on demand.
    /// A failed send drops the cached connection; nothing is retried.
    pub async fn transfer(&self, addr: &str, msg: &Message, req_id: i64) -> Result<(), TransportError> {
        let conn = self.get_or_connect(addr).await?;
        if let Err(e) = conn.send(msg, req_id) {
            tracing::warn!(addr, error = %e, "transfer failed");
            self.remove(addr);
            return Err(e);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    ConnectFailed {
        addr: String,
        source: std::io::Error,
    },

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("connection to {0} is closed")]
    Closed(String),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
