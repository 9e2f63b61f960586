//! Last-result cache for single-shot answers polled by the RPC front end.
//!
//! `take` loads and clears in one step, so each stored result reaches at
//! most one poller.

use std::sync::Arc;

use dashmap::DashMap;

#[derive(Clone)]
pub struct ResultCache<T> {
    results: Arc<DashMap<String, T>>,
}

impl<T> Default for ResultCache<T> {
    fn default() -> Self {
        Self {
            results: Arc::new(DashMap::new()),
        }
    }
}

impl<T> ResultCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a result, replacing any unpolled one under the same key.
    pub fn set(&self, key: impl Into<String>, result: T) {
        self.results.insert(key.into(), result);
    }

    /// Load and clear the result for `key`.
    pub fn take(&self, key: &str) -> Option<T> {
        self.results.remove(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
