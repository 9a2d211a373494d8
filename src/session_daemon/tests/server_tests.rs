//! End-to-end tests over real TCP connections.

use super::*;
use crate::domain::{Role, SessionState};
use crate::session_daemon::service::ServiceSettings;
use crate::store::MemoryStore;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

struct TestServer {
    addr: std::net::SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<Result<()>>,
}

impl TestServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let service = VotingService::new(
            Arc::new(MemoryStore::new()),
            ServiceSettings {
                timer_tick: Duration::from_millis(20),
                ..ServiceSettings::default()
            },
        );
        let (shutdown_tx, _) = broadcast::channel(1);
        let handle = tokio::spawn(serve(
            listener,
            service,
            Duration::from_secs(60),
            shutdown_tx.clone(),
        ));
        Self {
            addr,
            shutdown_tx,
            handle,
        }
    }

    async fn client(&self) -> TestClient {
        let stream = TcpStream::connect(self.addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut client = TestClient {
            reader: BufReader::new(reader),
            writer,
        };
        let hello = client.recv().await;
        assert_eq!(hello["type"], "hello");
        client
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        tokio::time::timeout(READ_TIMEOUT, self.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn send_raw(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    async fn send_bytes(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    async fn send(&mut self, message: Value) {
        self.send_raw(&message.to_string()).await;
    }

    async fn recv(&mut self) -> Value {
        let mut line = String::new();
        tokio::time::timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a message")
            .unwrap();
        serde_json::from_str(line.trim()).unwrap()
    }

    /// Reads snapshots until one satisfies `accept`.
    async fn recv_snapshot_where(&mut self, accept: impl Fn(&Value) -> bool) -> Value {
        loop {
            let state = self.recv_type("sessionState").await;
            if accept(&state["snapshot"]) {
                return state["snapshot"].clone();
            }
        }
    }

    /// Reads until a message of `kind` arrives, returning it.
    async fn recv_type(&mut self, kind: &str) -> Value {
        loop {
            let message = self.recv().await;
            if message["type"] == kind {
                return message;
            }
        }
    }
}

#[tokio::test]
async fn test_hello_and_ping() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    client.send(json!({"type": "ping"})).await;
    assert_eq!(client.recv().await, json!({"type": "pong"}));

    server.stop().await;
}

#[tokio::test]
async fn test_invalid_lines_keep_connection_open() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    client.send_raw("this is not json").await;
    assert_eq!(
        client.recv().await,
        json!({"type": "actionError", "message": "Invalid message"})
    );

    client.send(json!({"type": "fly"})).await;
    assert_eq!(client.recv().await["message"], "Invalid message");

    client.send(json!({"type": "ping"})).await;
    assert_eq!(client.recv().await["type"], "pong");

    server.stop().await;
}

#[tokio::test]
async fn test_non_utf8_line_keeps_connection_open() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    client.send_bytes(b"\xff\xfe{}\n").await;
    assert_eq!(
        client.recv().await,
        json!({"type": "actionError", "message": "Invalid message"})
    );

    client.send(json!({"type": "ping"})).await;
    assert_eq!(client.recv().await, json!({"type": "pong"}));

    server.stop().await;
}

#[tokio::test]
async fn test_voting_round_over_tcp() {
    let server = TestServer::start().await;
    let mut coord = server.client().await;
    let mut voter = server.client().await;

    coord.send(json!({"type": "start"})).await;
    assert_eq!(
        coord.recv().await,
        json!({"type": "role", "role": "coordinator"})
    );
    let code = coord.recv_type("sessionCode").await["code"]
        .as_str()
        .unwrap()
        .to_string();

    voter
        .send(json!({"type": "join", "code": code, "displayName": "  Ana  "}))
        .await;
    assert_eq!(voter.recv().await["role"], "participant");
    let snapshot = coord
        .recv_snapshot_where(|s| s["participantCount"] == 1)
        .await;
    assert_eq!(snapshot["participants"][0]["displayName"], "Ana");

    coord.send(json!({"type": "closeDoors"})).await;
    coord.send(json!({"type": "openVote"})).await;
    let snapshot = coord.recv_snapshot_where(|s| s["state"] != "OPEN").await;
    assert_eq!(snapshot["state"], "CLOSED");
    let snapshot = coord.recv_type("sessionState").await;
    assert_eq!(snapshot["snapshot"]["state"], "VOTING");

    voter.send(json!({"type": "castVote", "value": 5})).await;
    assert_eq!(
        voter.recv_type("voteAcknowledged").await,
        json!({"type": "voteAcknowledged", "value": 5})
    );

    coord.send(json!({"type": "closeVote"})).await;
    let snapshot = coord
        .recv_snapshot_where(|s| s["state"] == "RESULTS")
        .await;
    assert_eq!(snapshot["average"], 5.0);
    assert_eq!(snapshot["roundNumber"], 1);
    assert_eq!(
        snapshot["history"][0]["votesByName"],
        json!([{"displayName": "Ana", "value": 5}])
    );

    coord.send(json!({"type": "end"})).await;
    assert_eq!(
        voter.recv_type("sessionEnded").await,
        json!({"type": "sessionEnded"})
    );

    server.stop().await;
}

#[tokio::test]
async fn test_dropped_connection_reconnects_by_identity() {
    let server = TestServer::start().await;
    let mut coord = server.client().await;
    coord.send(json!({"type": "start"})).await;
    let code = coord.recv_type("sessionCode").await["code"].clone();

    let identity = {
        let mut voter = server.client().await;
        voter
            .send(json!({"type": "join", "code": code, "displayName": "Bo", "identity": "bo-device-1"}))
            .await;
        let assigned = voter.recv_type("assignedIdentity").await;
        assert_eq!(assigned["identity"], "bo-device-1");
        "bo-device-1".to_string()
    };

    // Socket closed: the participant stays but shows as disconnected
    let snapshot = coord
        .recv_snapshot_where(|s| s["participants"][0]["connected"] == false)
        .await;
    assert_eq!(snapshot["participantCount"], 1);

    let mut voter = server.client().await;
    voter
        .send(json!({"type": "reconnect", "identity": identity, "code": code}))
        .await;
    assert_eq!(
        voter.recv().await,
        json!({"type": "role", "role": "participant"})
    );

    let snapshot = coord
        .recv_snapshot_where(|s| s["participants"][0]["connected"] == true)
        .await;
    assert_eq!(snapshot["participantCount"], 1);

    server.stop().await;
}

#[tokio::test]
async fn test_reconnect_to_unknown_session_fails() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    client
        .send(json!({"type": "reconnect", "identity": "ghost", "code": "0000"}))
        .await;
    assert_eq!(client.recv().await, json!({"type": "reconnectFailed"}));
    assert_eq!(
        client.recv().await,
        json!({"type": "role", "role": serde_json::to_value(Role::Unassigned).unwrap()})
    );

    server.stop().await;
}

#[tokio::test]
async fn test_snapshot_state_names_match_wire_format() {
    assert_eq!(serde_json::to_value(SessionState::Results).unwrap(), "RESULTS");
}
