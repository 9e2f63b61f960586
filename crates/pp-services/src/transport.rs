//! TCP transport: framed reader/writer tasks behind a `Connection`.
//!
//! Each connection runs two tasks. The writer drains the connection's frame
//! queue onto the socket. The reader decodes frames and runs the dispatch
//! table inline, so handlers for one connection run in arrival order.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use pp_core::wire::HEADER_LEN;
use pp_core::{Message, MessageHeader, WireError};

use crate::connection::{Connection, Connector, TransportError};
use crate::dispatch::EventDispatcher;

/// One frame off the wire. `message` is an error when the type tag is
/// unknown or the payload doesn't decode; the frame has still been consumed.
pub struct Frame {
    pub header: MessageHeader,
    pub message: Result<Message, WireError>,
}

/// Read one frame. `Ok(None)` on a clean EOF at a frame boundary; a stream
/// that ends partway through a header is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut head[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("stream ended {filled} bytes into a frame header"),
            )
            .into());
        }
        filled += n;
    }
    let header = MessageHeader::parse(&head)?;

    let mut payload = vec![0u8; header.length() as usize];
    reader.read_exact(&mut payload).await?;

    let message = header
        .msg_type()
        .and_then(|msg_type| Message::decode(msg_type, &payload));
    Ok(Some(Frame { header, message }))
}

/// Decode a complete in-memory frame (header + payload).
pub fn decode_frame(frame: &[u8]) -> Result<(MessageHeader, Message), WireError> {
    let header = MessageHeader::parse(frame)?;
    let end = HEADER_LEN + header.length() as usize;
    if frame.len() < end {
        return Err(WireError::Truncated(frame.len()));
    }
    let message = Message::decode(header.msg_type()?, &frame[HEADER_LEN..end])?;
    Ok((header, message))
}

/// Wrap an established stream in a `Connection` and start its tasks.
pub fn spawn_connection(
    stream: TcpStream,
    addr: impl Into<String>,
    app_ver: u16,
    dispatcher: Arc<EventDispatcher>,
) -> Connection {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "set_nodelay failed");
    }
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = Connection::new(addr, app_ver, tx);

    tokio::spawn(write_loop(writer, rx, conn.closed(), conn.addr().to_string()));
    tokio::spawn(read_loop(reader, conn.clone(), dispatcher, conn.closed()));
    conn
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: broadcast::Receiver<()>,
    addr: String,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = writer.write_all(&frame).await {
                    tracing::warn!(addr = %addr, error = %e, "write failed");
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
    tracing::trace!(addr = %addr, "writer exited");
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    conn: Connection,
    dispatcher: Arc<EventDispatcher>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            frame = read_frame(&mut reader) => {
                match frame {
                    Ok(Some(Frame { header, message: Ok(msg) })) => {
                        dispatcher.dispatch(&conn, header.req_id(), msg);
                    }
                    Ok(Some(Frame { header, message: Err(e) })) => {
                        tracing::warn!(
                            addr = conn.addr(),
                            msg_type = header.raw_msg_type(),
                            error = %e,
                            "undecodable message dropped"
                        );
                    }
                    Ok(None) => {
                        tracing::debug!(addr = conn.addr(), "peer closed connection");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(addr = conn.addr(), error = %e, "read failed");
                        break;
                    }
                }
            }
        }
    }
    conn.close();
}

// ── Outbound ─────────────────────────────────────────────────────────────────

pub struct TcpConnector {
    dispatcher: Arc<EventDispatcher>,
    app_ver: u16,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(dispatcher: Arc<EventDispatcher>, app_ver: u16, connect_timeout: Duration) -> Self {
        Self {
            dispatcher,
            app_ver,
            connect_timeout,
        }
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, Result<Connection, TransportError>> {
        Box::pin(async move {
            let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| TransportError::ConnectTimeout(addr.to_string()))?
                .map_err(|source| TransportError::ConnectFailed {
                    addr: addr.to_string(),
                    source,
                })?;
            Ok(spawn_connection(
                stream,
                addr,
                self.app_ver,
                self.dispatcher.clone(),
            ))
        })
    }
}

// ── Inbound ──────────────────────────────────────────────────────────────────

/// Accept peer connections until shutdown.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Arc<EventDispatcher>,
    app_ver: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "accepting peer connections");
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("peer listener shutting down");
                return Ok(());
            }

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                tracing::debug!(peer = %peer, "inbound connection");
                spawn_connection(stream, peer.to_string(), app_ver, dispatcher.clone());
            }
        }
    }
}
