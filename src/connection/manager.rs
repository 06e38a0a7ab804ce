//! Connection manager.
//!
//! Ref-counted registry of live connections keyed by an opaque string
//! (typically `"{hub_id}:{channel}:{params-digest}"`). Pages acquire a
//! connection on mount and release it on unmount; the connection itself is
//! only destroyed when the last holder releases it. Constructed explicitly
//! at process init and threaded through - tests instantiate their own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::broadcast;

use super::{Connection, ConnectionEvent};

/// Stable registry key for a `(hub, channel, params)` triple.
///
/// Params are folded into a short digest so structurally equal params map
/// to the same connection regardless of object key order quirks upstream.
pub fn connection_key(hub_id: &str, channel: &str, params: &serde_json::Value) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(params.to_string().as_bytes());
    let short: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{hub_id}:{channel}:{short}")
}

struct Entry {
    conn: Arc<Connection>,
    ref_count: u32,
}

/// Ref-counted connection registry.
#[derive(Default)]
pub struct ConnectionManager {
    entries: StdMutex<HashMap<String, Entry>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field(
                "entries",
                &self.entries.lock().expect("entries lock poisoned").len(),
            )
            .finish()
    }
}

impl ConnectionManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the connection under `key`, creating it with `make` on first
    /// acquire. Each acquire must be paired with a [`Self::release`].
    pub fn acquire(
        &self,
        key: &str,
        make: impl FnOnce() -> Arc<Connection>,
    ) -> Arc<Connection> {
        let mut entries = self.entries.lock().expect("entries lock poisoned");
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            conn: make(),
            ref_count: 0,
        });
        entry.ref_count += 1;
        Arc::clone(&entry.conn)
    }

    /// The connection under `key`, without touching the ref-count.
    pub fn get(&self, key: &str) -> Option<Arc<Connection>> {
        self.entries
            .lock()
            .expect("entries lock poisoned")
            .get(key)
            .map(|entry| Arc::clone(&entry.conn))
    }

    /// Release one reference. The connection is destroyed when the last
    /// holder releases it. Returns the remaining count.
    pub fn release(&self, key: &str) -> u32 {
        let to_destroy = {
            let mut entries = self.entries.lock().expect("entries lock poisoned");
            let Some(entry) = entries.get_mut(key) else {
                return 0;
            };
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count > 0 {
                return entry.ref_count;
            }
            entries.remove(key).map(|entry| entry.conn)
        };

        if let Some(conn) = to_destroy {
            conn.destroy();
        }
        0
    }

    /// Destroy the connection under `key` regardless of ref-count.
    pub fn destroy(&self, key: &str) {
        let removed = self
            .entries
            .lock()
            .expect("entries lock poisoned")
            .remove(key);
        if let Some(entry) = removed {
            entry.conn.destroy();
        }
    }

    /// Observe a connection's events without affecting its lifetime.
    pub fn subscribe(&self, key: &str) -> Option<broadcast::Receiver<ConnectionEvent>> {
        self.get(key).map(|conn| conn.events())
    }

    /// Keys of all live connections.
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .expect("entries lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_harness::{ConnHarness, URL};
    use crate::connection::{ChannelSpec, ConnectionState};

    fn make_conn(h: &ConnHarness) -> Arc<Connection> {
        Connection::new(Arc::clone(&h.bridge), "h1", URL, ChannelSpec::hub())
    }

    #[tokio::test]
    async fn test_acquire_reuses_instance() {
        let h = ConnHarness::new();
        let manager = ConnectionManager::new();

        let a = manager.acquire("h1:hub", || make_conn(&h));
        let b = manager.acquire("h1:hub", || panic!("must not be called"));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_release_destroys_at_zero() {
        let mut h = ConnHarness::new();
        let bundle = h.bundle();
        let manager = ConnectionManager::new();

        let conn = manager.acquire("h1:hub", || make_conn(&h));
        conn.initialize(Some(bundle)).await.expect("initialize");
        manager.acquire("h1:hub", || panic!("must not be called"));

        assert_eq!(manager.release("h1:hub"), 1);
        assert_eq!(conn.state(), ConnectionState::Connected, "still referenced");

        assert_eq!(manager.release("h1:hub"), 0);
        assert_eq!(conn.state(), ConnectionState::Disconnected, "destroyed");
        assert!(manager.get("h1:hub").is_none());
    }

    #[tokio::test]
    async fn test_destroy_ignores_refcount() {
        let h = ConnHarness::new();
        let manager = ConnectionManager::new();

        let conn = manager.acquire("h1:hub", || make_conn(&h));
        manager.acquire("h1:hub", || panic!("must not be called"));
        manager.destroy("h1:hub");

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(manager.get("h1:hub").is_none());
    }

    #[test]
    fn test_connection_key_stable_and_distinct() {
        let a = connection_key("h1", "terminal", &serde_json::json!({"agent_index": 0}));
        let b = connection_key("h1", "terminal", &serde_json::json!({"agent_index": 0}));
        let c = connection_key("h1", "terminal", &serde_json::json!({"agent_index": 1}));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("h1:terminal:"));
    }

    #[tokio::test]
    async fn test_subscribe_is_passive() {
        let h = ConnHarness::new();
        let manager = ConnectionManager::new();
        manager.acquire("h1:hub", || make_conn(&h));

        assert!(manager.subscribe("h1:hub").is_some());
        assert!(manager.subscribe("missing").is_none());
        // Observing did not bump the count: one release tears down.
        assert_eq!(manager.release("h1:hub"), 0);
        assert!(manager.keys().is_empty());
    }
}
