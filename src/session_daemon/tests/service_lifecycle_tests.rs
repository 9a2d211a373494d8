//! Round timers, code allocation, the maintenance sweep and storage failures.

use super::service_tests::{join, service, settings, start, vote, Client};
use super::*;
use crate::domain::SessionState;
use crate::store::MemoryStore;
use async_trait::async_trait;

#[tokio::test]
async fn test_timer_closes_round_automatically() {
    let service = service();
    let (mut coord, code, _) = start(&service).await;
    let (a, _) = join(&service, &code, "Ana").await;
    service.handle(coord.conn, ClientMessage::CloseDoors).await;
    service
        .handle(
            coord.conn,
            ClientMessage::OpenVote {
                timer_seconds: Some(1),
            },
        )
        .await;
    vote(&service, &a, 3).await;

    let snapshot = coord.last_snapshot();
    assert_eq!(snapshot.state, SessionState::Voting);
    assert!(snapshot.timer_deadline.is_some());

    tokio::time::sleep(Duration::from_millis(1400)).await;

    let snapshot = coord.last_snapshot();
    assert_eq!(snapshot.state, SessionState::Results);
    assert_eq!(snapshot.average, Some(3.0));
    assert_eq!(snapshot.timer_deadline, None);
    assert!(!service
        .timers()
        .is_armed(&JoinCode::parse(&code).unwrap())
        .await);
}

#[tokio::test]
async fn test_manual_close_and_plain_reopen_cancel_timer() {
    let service = service();
    let (mut coord, code, _) = start(&service).await;
    let join_code = JoinCode::parse(&code).unwrap();
    service.handle(coord.conn, ClientMessage::CloseDoors).await;

    service
        .handle(
            coord.conn,
            ClientMessage::OpenVote {
                timer_seconds: Some(30),
            },
        )
        .await;
    assert!(service.timers().is_armed(&join_code).await);

    service.handle(coord.conn, ClientMessage::CloseVote).await;
    assert!(!service.timers().is_armed(&join_code).await);

    service
        .handle(
            coord.conn,
            ClientMessage::OpenVote {
                timer_seconds: Some(30),
            },
        )
        .await;
    service
        .handle(coord.conn, ClientMessage::CloseVote)
        .await;
    service
        .handle(
            coord.conn,
            ClientMessage::OpenVote {
                timer_seconds: Some(0),
            },
        )
        .await;
    assert!(!service.timers().is_armed(&join_code).await);
    assert_eq!(coord.last_snapshot().timer_deadline, None);
}

#[tokio::test]
async fn test_timer_is_capped() {
    let service = VotingService::new(
        Arc::new(MemoryStore::new()),
        ServiceSettings {
            max_timer_secs: 60,
            ..settings()
        },
    );
    let (mut coord, _, _) = start(&service).await;
    service.handle(coord.conn, ClientMessage::CloseDoors).await;
    service
        .handle(
            coord.conn,
            ClientMessage::OpenVote {
                timer_seconds: Some(86_400),
            },
        )
        .await;

    let deadline = coord.last_snapshot().timer_deadline.unwrap();
    assert!(deadline <= Utc::now() + chrono::Duration::seconds(61));
}

#[tokio::test]
async fn test_start_allocates_unique_codes() {
    let service = service();
    let mut codes = HashSet::new();
    let mut clients = Vec::new();
    for _ in 0..50 {
        let (client, code, _) = start(&service).await;
        assert!(codes.insert(code));
        clients.push(client);
    }
    assert_eq!(codes.len(), 50);
}

#[tokio::test]
async fn test_sweep_drops_expired_sessions() {
    let service = VotingService::new(
        Arc::new(MemoryStore::new()),
        ServiceSettings {
            session_ttl: Duration::from_millis(50),
            ..settings()
        },
    );
    let (mut coord, code, _) = start(&service).await;
    let join_code = JoinCode::parse(&code).unwrap();
    assert_eq!(service.sweep().await, 0);

    tokio::time::sleep(Duration::from_millis(120)).await;
    coord.drain();

    assert_eq!(service.sweep().await, 1);
    assert_eq!(service.routing().room_size(&join_code).await, 0);
    assert!(service.locks().is_empty().await);
    // Expiry is silent
    assert!(coord.drain().is_empty());

    service.handle(coord.conn, ClientMessage::CloseDoors).await;
    assert_eq!(coord.last_error(), "Not in a session");
}

#[tokio::test]
async fn test_ping_pong() {
    let service = service();
    let mut client = Client::connect(&service).await;
    service.handle(client.conn, ClientMessage::Ping).await;
    assert_eq!(client.drain(), vec![ServerMessage::Pong]);
}

struct FailingStore;

#[async_trait]
impl SessionStore for FailingStore {
    async fn get(&self, _code: &JoinCode) -> anyhow::Result<Option<Session>> {
        anyhow::bail!("store unreachable")
    }
    async fn set(&self, _session: &Session, _ttl: Duration) -> anyhow::Result<()> {
        anyhow::bail!("store unreachable")
    }
    async fn delete(&self, _code: &JoinCode) -> anyhow::Result<()> {
        anyhow::bail!("store unreachable")
    }
    async fn exists(&self, _code: &JoinCode) -> anyhow::Result<bool> {
        anyhow::bail!("store unreachable")
    }
    async fn bind_identity(
        &self,
        _identity: &Identity,
        _code: &JoinCode,
        _ttl: Duration,
    ) -> anyhow::Result<()> {
        anyhow::bail!("store unreachable")
    }
    async fn bound_session(&self, _identity: &Identity) -> anyhow::Result<Option<JoinCode>> {
        Ok(None)
    }
    async fn unbind_identity(&self, _identity: &Identity) -> anyhow::Result<()> {
        anyhow::bail!("store unreachable")
    }
    async fn purge_expired(&self) -> anyhow::Result<usize> {
        anyhow::bail!("store unreachable")
    }
}

#[tokio::test]
async fn test_storage_failures_surface_as_opaque_server_error() {
    let service = VotingService::new(Arc::new(FailingStore), settings());
    let mut client = Client::connect(&service).await;

    service
        .handle(client.conn, ClientMessage::Start { identity: None })
        .await;
    assert_eq!(client.last_error(), "Server error");

    service
        .handle(
            client.conn,
            ClientMessage::Reconnect {
                identity: "someone".to_string(),
                code: "1234".to_string(),
            },
        )
        .await;
    let messages = client.drain();
    assert!(messages.contains(&ServerMessage::action_error("Server error")));
    assert!(!messages.contains(&ServerMessage::ReconnectFailed));

    // Sweeping with a broken store does not panic
    assert_eq!(service.sweep().await, 0);
}
