//! Routes inbound messages to handlers by message type.
//!
//! Handlers are collected on a `HandlerRegistry` during startup and
//! installed into the `EventDispatcher` once; after that the table is
//! read-only and shared by every connection's reader task.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use pp_core::{Message, MessageType};

use crate::connection::Connection;

/// Advisory time budget for one handler call. It is checked after the
/// handler returns and an overrun is only logged; nothing is cut short.
/// Handlers run on the connection's reader task and must hand slow work to
/// a spawned task.
pub const HANDLER_BUDGET: Duration = Duration::from_millis(100);

/// Handles one kind of inbound message.
pub trait EventHandler: Send + Sync {
    fn handle(&self, conn: &Connection, req_id: i64, msg: Message) -> anyhow::Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&Connection, i64, Message) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, conn: &Connection, req_id: i64, msg: Message) -> anyhow::Result<()> {
        self(conn, req_id, msg)
    }
}

/// Startup-time builder for the dispatch table.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<MessageType, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `msg_type`. A later registration for the same
    /// type replaces the earlier one.
    pub fn register(&mut self, msg_type: MessageType, handler: impl EventHandler + 'static) {
        if self.handlers.insert(msg_type, Arc::new(handler)).is_some() {
            tracing::warn!(%msg_type, "handler replaced");
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Default)]
pub struct EventDispatcher {
    table: OnceLock<HashMap<MessageType, Arc<dyn EventHandler>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the handler table. Only the first call takes effect.
    pub fn install(&self, registry: HandlerRegistry) -> Result<(), DispatchError> {
        let count = registry.handlers.len();
        self.table
            .set(registry.handlers)
            .map_err(|_| DispatchError::AlreadyInstalled)?;
        tracing::info!(handlers = count, "dispatch table installed");
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        self.table.get().is_some()
    }

    /// Run the handler for `msg`. Returns false if no handler is registered
    /// for its type; the message is dropped.
    pub fn dispatch(&self, conn: &Connection, req_id: i64, msg: Message) -> bool {
        let msg_type = msg.message_type();
        let Some(handler) = self.table.get().and_then(|t| t.get(&msg_type)) else {
            tracing::warn!(%msg_type, addr = conn.addr(), "no handler registered, message dropped");
            return false;
        };

        let started = Instant::now();
        if let Err(e) = handler.handle(conn, req_id, msg) {
            tracing::warn!(%msg_type, addr = conn.addr(), error = %e, "handler failed");
        }
        let elapsed = started.elapsed();
        if elapsed > HANDLER_BUDGET {
            tracing::warn!(
                %msg_type,
                elapsed_ms = elapsed.as_millis() as u64,
                "handler exceeded budget"
            );
        }
        true
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch table already installed")]
    AlreadyInstalled,
}
