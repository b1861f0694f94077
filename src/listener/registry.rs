//! Live-connection tracking for graceful shutdown draining.
//!
//! Each accepted connection registers itself for the lifetime of its
//! `HttpConnection::process` call; the listener polls
//! [`ConnectionRegistry::active_connections`] after it stops accepting to know
//! when every in-flight connection has finished and it's safe to return.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub(crate) struct ConnectionRegistry {
    next_id: AtomicU64,
    live: Mutex<HashSet<u64>>,
}

impl ConnectionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(self: &Arc<Self>) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.lock().unwrap().insert(id);
        ConnectionGuard { registry: Arc::clone(self), id }
    }

    pub(crate) fn active_connections(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

/// Held for the lifetime of one connection; removes it from the registry on drop.
pub(crate) struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    id: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.live.lock().unwrap().remove(&self.id);
    }
}
