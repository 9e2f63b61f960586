//! Correlation registry. Turns asynchronous pushes into bounded waits.
//!
//! A caller registers a waiter under a key, triggers some remote action, and
//! waits. Whoever produces the answer (usually an inbound message handler)
//! publishes it under the same key. Rules:
//!
//! - One waiter per key. A second `subscribe` replaces the first; the
//!   replaced handle never receives anything and runs out its deadline.
//! - `publish` never blocks. If the value can't be placed in the waiter's
//!   channel right now, the entry is dropped instead.
//! - The waiter cleans up after itself: dropping a `Waiter` (on success,
//!   timeout, or abandonment) removes its registration, unless a newer
//!   registration has already taken the key.
//! - A publish that loses the race against a timing-out waiter is lost.
//!   Nothing is retried here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

struct Slot<T> {
    id: u64,
    tx: mpsc::Sender<T>,
}

struct Inner<T> {
    namespace: &'static str,
    capacity: usize,
    next_id: AtomicU64,
    waiters: DashMap<String, Slot<T>>,
}

/// A keyed registry of waiters for one payload type.
///
/// Cheap to clone; clones share the same registry.
pub struct Correlation<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Correlation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Correlation<T> {
    /// A registry whose waiters hold a single value.
    pub fn new(namespace: &'static str) -> Self {
        Self::with_capacity(namespace, 1)
    }

    /// A registry whose waiters buffer up to `capacity` values (streamed results).
    pub fn with_capacity(namespace: &'static str, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                namespace,
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
                waiters: DashMap::new(),
            }),
        }
    }

    pub fn namespace(&self) -> &'static str {
        self.inner.namespace
    }

    /// Register a fresh waiter for `key`, replacing any existing one.
    pub fn subscribe(&self, key: impl Into<String>) -> Waiter<T> {
        let key = key.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);

        let replaced = self
            .inner
            .waiters
            .insert(key.clone(), Slot { id, tx: tx.clone() });
        if replaced.is_some() {
            tracing::debug!(
                namespace = self.inner.namespace,
                key = %key,
                "waiter replaced by newer subscription"
            );
        }

        Waiter {
            key,
            id,
            rx,
            _keepalive: tx,
            registry: self.clone(),
        }
    }

    /// Remove whatever waiter is registered under `key`. Idempotent.
    pub fn unsubscribe(&self, key: &str) {
        self.inner.waiters.remove(key);
    }

    /// Offer `value` to the waiter registered under `key`.
    ///
    /// Returns true if the value was placed in the waiter's channel. With no
    /// waiter this is a no-op. A full or abandoned channel drops the value
    /// and the entry.
    pub fn publish(&self, key: &str, value: T) -> bool {
        // The shard guard must be gone before remove_if below.
        let (id, outcome) = match self.inner.waiters.get(key) {
            Some(slot) => (slot.id, slot.tx.try_send(value)),
            None => {
                tracing::trace!(namespace = self.inner.namespace, key, "publish without waiter");
                return false;
            }
        };

        match outcome {
            Ok(()) => true,
            Err(e) => {
                let reason = match e {
                    TrySendError::Full(_) => "full",
                    TrySendError::Closed(_) => "closed",
                };
                self.remove_slot(key, id);
                tracing::debug!(
                    namespace = self.inner.namespace,
                    key,
                    reason,
                    "waiter could not take value, dropped"
                );
                false
            }
        }
    }

    /// Subscribe and wait up to `timeout` for a single value.
    pub async fn wait_for(
        &self,
        key: impl Into<String>,
        timeout: Duration,
    ) -> Result<T, CorrelationError> {
        self.subscribe(key).wait(timeout).await
    }

    pub fn is_subscribed(&self, key: &str) -> bool {
        self.inner.waiters.contains_key(key)
    }

    /// Number of registered waiters.
    pub fn len(&self) -> usize {
        self.inner.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.waiters.is_empty()
    }

    fn remove_slot(&self, key: &str, id: u64) {
        self.inner.waiters.remove_if(key, |_, slot| slot.id == id);
    }
}

/// Caller-owned handle for one registration.
///
/// Dropping it unregisters the key if this handle is still the current
/// registration.
pub struct Waiter<T: Send + 'static> {
    key: String,
    id: u64,
    rx: mpsc::Receiver<T>,
    // Held so recv() only ends on a value or the deadline, never on closure.
    _keepalive: mpsc::Sender<T>,
    registry: Correlation<T>,
}

impl<T: Send + 'static> Waiter<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait up to `timeout` for the next value. Each call has its own deadline.
    pub async fn next(&mut self, timeout: Duration) -> Result<T, CorrelationError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) | Err(_) => {
                tracing::debug!(
                    namespace = self.registry.namespace(),
                    key = %self.key,
                    timeout_ms = timeout.as_millis() as u64,
                    "wait timed out"
                );
                Err(CorrelationError::Timeout {
                    namespace: self.registry.namespace(),
                    key: self.key.clone(),
                })
            }
        }
    }

    /// Wait for a single value, then unregister.
    pub async fn wait(mut self, timeout: Duration) -> Result<T, CorrelationError> {
        self.next(timeout).await
    }
}

impl<T: Send + 'static> Drop for Waiter<T> {
    fn drop(&mut self) {
        self.registry.remove_slot(&self.key, self.id);
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("timed out waiting on {namespace} key {key}")]
    Timeout { namespace: &'static str, key: String },
}
