//! Connection routing table.
//!
//! Maps transport connections to durable identities and groups them into one
//! room per session. Nothing here is persisted; the table is rebuilt from
//! join and reconnect requests after a restart.

use super::protocol::ServerMessage;
use crate::domain::{Identity, JoinCode};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};

/// Transport connection id. Changes on every reconnect.
pub type ConnectionId = u64;

/// Outbound queue drained by a connection's writer task.
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// Who a connection speaks for, and in which session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub identity: Identity,
    pub code: JoinCode,
}

struct Connection {
    outbox: Outbox,
    binding: Option<Binding>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Connection>,
    /// Current connection per identity; an identity has at most one
    identities: HashMap<Identity, ConnectionId>,
    rooms: HashMap<JoinCode, HashSet<ConnectionId>>,
}

impl Inner {
    /// Detaches `conn` from its identity and room, returning its old binding.
    fn detach(&mut self, conn: ConnectionId) -> Option<Binding> {
        let binding = self.connections.get_mut(&conn)?.binding.take()?;
        if self.identities.get(&binding.identity) == Some(&conn) {
            self.identities.remove(&binding.identity);
        }
        if let Some(room) = self.rooms.get_mut(&binding.code) {
            room.remove(&conn);
            if room.is_empty() {
                self.rooms.remove(&binding.code);
            }
        }
        Some(binding)
    }
}

/// Connection/identity/room registry shared by all connections.
#[derive(Default)]
pub struct RoutingTable {
    inner: RwLock<Inner>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, conn: ConnectionId, outbox: Outbox) {
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            conn,
            Connection {
                outbox,
                binding: None,
            },
        );
    }

    /// Forgets `conn`. Returns its binding only if `conn` was still the
    /// identity's current connection, i.e. nobody has reconnected since.
    pub async fn unregister(&self, conn: ConnectionId) -> Option<Binding> {
        let mut inner = self.inner.write().await;
        let current = inner
            .connections
            .get(&conn)
            .and_then(|c| c.binding.as_ref())
            .is_some_and(|b| inner.identities.get(&b.identity) == Some(&conn));
        let binding = inner.detach(conn);
        inner.connections.remove(&conn);
        binding.filter(|_| current)
    }

    /// Associates `conn` with `identity` in session `code`.
    ///
    /// Any previous connection of the same identity is detached so it stops
    /// receiving broadcasts; its own disconnect later becomes a no-op.
    pub async fn bind(&self, conn: ConnectionId, identity: &Identity, code: &JoinCode) {
        let mut inner = self.inner.write().await;
        if !inner.connections.contains_key(&conn) {
            return;
        }
        inner.detach(conn);
        if let Some(previous) = inner.identities.get(identity).copied() {
            if previous != conn {
                inner.detach(previous);
            }
        }

        inner.identities.insert(identity.clone(), conn);
        inner.rooms.entry(code.clone()).or_default().insert(conn);
        if let Some(connection) = inner.connections.get_mut(&conn) {
            connection.binding = Some(Binding {
                identity: identity.clone(),
                code: code.clone(),
            });
        }
    }

    /// Whether `identity` currently has a live connection.
    pub async fn is_connected(&self, identity: &Identity) -> bool {
        self.inner.read().await.identities.contains_key(identity)
    }

    pub async fn binding(&self, conn: ConnectionId) -> Option<Binding> {
        let inner = self.inner.read().await;
        inner.connections.get(&conn)?.binding.clone()
    }

    /// Sends to a single connection. Returns false if it is gone.
    pub async fn send(&self, conn: ConnectionId, message: ServerMessage) -> bool {
        let inner = self.inner.read().await;
        match inner.connections.get(&conn) {
            Some(connection) => connection.outbox.send(message).is_ok(),
            None => false,
        }
    }

    /// Sends `message` to every connection in the room for `code`.
    /// Returns the number of connections reached.
    pub async fn broadcast(&self, code: &JoinCode, message: &ServerMessage) -> usize {
        let inner = self.inner.read().await;
        let Some(room) = inner.rooms.get(code) else {
            return 0;
        };
        room.iter()
            .filter_map(|conn| inner.connections.get(conn))
            .filter(|connection| connection.outbox.send(message.clone()).is_ok())
            .count()
    }

    /// Unbinds every connection in the room for `code`. The connections stay
    /// registered and may start or join another session.
    pub async fn evict_room(&self, code: &JoinCode) -> usize {
        let mut inner = self.inner.write().await;
        let Some(room) = inner.rooms.get(code).cloned() else {
            return 0;
        };
        for conn in &room {
            inner.detach(*conn);
        }
        inner.rooms.remove(code);
        room.len()
    }

    pub async fn room_codes(&self) -> Vec<JoinCode> {
        self.inner.read().await.rooms.keys().cloned().collect()
    }

    pub async fn room_size(&self, code: &JoinCode) -> usize {
        self.inner
            .read()
            .await
            .rooms
            .get(code)
            .map_or(0, HashSet::len)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}

#[cfg(test)]
#[path = "tests/routing_tests.rs"]
mod routing_tests;
