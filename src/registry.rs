//! Registry of live connections.
//!
//! Slab allocation gives every accepted socket a small reusable token; a side
//! index maps bound client ids to tokens for targeted event delivery and the
//! connected-clients query. Shared by the accept loop, the monitors and the
//! event router, so all access goes through one lock.

use crate::connection::Connection;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use slab::Slab;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Summary row for the connected-clients query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub client_id: String,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
    /// Client version from the handshake.
    pub version: u32,
}

struct Inner {
    connections: Slab<Arc<Connection>>,
    by_client: HashMap<String, usize>,
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                connections: Slab::with_capacity(max_connections.min(4096)),
                by_client: HashMap::new(),
            }),
            max_connections,
        }
    }

    /// Insert a connection built from its assigned token.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert_with(
        &self,
        make: impl FnOnce(usize) -> Arc<Connection>,
    ) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write();
        if inner.connections.len() >= self.max_connections {
            return None;
        }
        let entry = inner.connections.vacant_entry();
        let conn = make(entry.key());
        entry.insert(Arc::clone(&conn));
        Some(conn)
    }

    pub fn get(&self, token: usize) -> Option<Arc<Connection>> {
        self.inner.read().connections.get(token).cloned()
    }

    /// Map `client_id` to the connection at `token`.
    ///
    /// A client id maps to its newest connection; the previously mapped
    /// token, if any, is returned.
    pub fn bind_client(&self, token: usize, client_id: &str) -> Option<usize> {
        let mut inner = self.inner.write();
        if !inner.connections.contains(token) {
            return None;
        }
        inner
            .by_client
            .insert(client_id.to_string(), token)
            .filter(|&previous| previous != token)
    }

    /// Connection currently bound to `client_id`.
    pub fn by_client(&self, client_id: &str) -> Option<Arc<Connection>> {
        let inner = self.inner.read();
        let token = *inner.by_client.get(client_id)?;
        inner.connections.get(token).cloned()
    }

    /// Remove a connection from the registry.
    ///
    /// The client index entry goes too, unless a newer connection took it.
    pub fn remove(&self, token: usize) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write();
        let conn = inner.connections.try_remove(token)?;
        if let Some(client_id) = conn.client_id() {
            if inner.by_client.get(&client_id) == Some(&token) {
                inner.by_client.remove(&client_id);
            }
        }
        Some(conn)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.inner.read().connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.inner.read().connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Clone out every live connection so callers can work without the lock.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner
            .read()
            .connections
            .iter()
            .map(|(_, conn)| Arc::clone(conn))
            .collect()
    }

    /// Bound clients, ordered by client id.
    pub fn clients(&self) -> Vec<ClientInfo> {
        let inner = self.inner.read();
        let mut clients: Vec<ClientInfo> = inner
            .by_client
            .iter()
            .filter_map(|(client_id, &token)| {
                let conn = inner.connections.get(token)?;
                Some(ClientInfo {
                    client_id: client_id.clone(),
                    peer: conn.peer(),
                    connected_at: conn.connected_at(),
                    version: conn.version(),
                })
            })
            .collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Capabilities;
    use tokio::io::sink;

    fn add(registry: &ConnectionRegistry, port: u16) -> Option<Arc<Connection>> {
        let peer: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        registry.insert_with(|token| Connection::new(token, peer, Box::new(sink()), 30))
    }

    #[test]
    fn test_connection_registry() {
        let registry = ConnectionRegistry::new(2);

        let c1 = add(&registry, 1001).unwrap();
        let c2 = add(&registry, 1002).unwrap();

        // At capacity
        assert!(add(&registry, 1003).is_none());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(c1.token()).unwrap().peer().port(), 1001);
        assert_eq!(registry.get(c2.token()).unwrap().peer().port(), 1002);

        registry.remove(c1.token());
        assert!(registry.get(c1.token()).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(c1.token()).is_none());

        // The freed slot is reused.
        let c3 = add(&registry, 1004).unwrap();
        assert_eq!(c3.token(), c1.token());
    }

    #[test]
    fn test_client_index_follows_newest_connection() {
        let registry = ConnectionRegistry::new(8);
        let old = add(&registry, 2001).unwrap();
        let new = add(&registry, 2002).unwrap();

        old.complete_handshake("app".into(), 5000, Capabilities::default());
        assert_eq!(registry.bind_client(old.token(), "app"), None);
        new.complete_handshake("app".into(), 5000, Capabilities::default());
        assert_eq!(registry.bind_client(new.token(), "app"), Some(old.token()));

        // Removing the stale connection keeps the newer binding.
        registry.remove(old.token());
        assert_eq!(
            registry.by_client("app").map(|c| c.token()),
            Some(new.token())
        );

        let clients = registry.clients();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].client_id, "app");
        assert_eq!(clients[0].peer.port(), 2002);

        registry.remove(new.token());
        assert!(registry.by_client("app").is_none());
        assert!(registry.is_empty());
    }
}
