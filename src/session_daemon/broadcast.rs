//! Snapshot fan-out to a session's room.

use super::protocol::ServerMessage;
use super::routing::RoutingTable;
use crate::domain::{JoinCode, Session, SessionSnapshot};
use std::sync::Arc;

/// Publishes session snapshots through the routing table's rooms.
///
/// Callers publish only after the corresponding store write has succeeded,
/// and while still holding the session lock, so members observe snapshots in
/// commit order.
#[derive(Clone)]
pub struct Broadcaster {
    routing: Arc<RoutingTable>,
}

impl Broadcaster {
    pub fn new(routing: Arc<RoutingTable>) -> Self {
        Self { routing }
    }

    /// Sends a redacted snapshot of `session` to every member connection.
    /// Returns the number of connections reached.
    pub async fn publish(&self, session: &Session) -> usize {
        let message = ServerMessage::SessionState {
            snapshot: Some(SessionSnapshot::from(session)),
        };
        let reached = self.routing.broadcast(&session.code, &message).await;
        tracing::debug!(
            code = %session.code,
            state = %session.state,
            reached,
            "snapshot published"
        );
        reached
    }

    pub async fn session_ended(&self, code: &JoinCode) -> usize {
        self.routing.broadcast(code, &ServerMessage::SessionEnded).await
    }
}
