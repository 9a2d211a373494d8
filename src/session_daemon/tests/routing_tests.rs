use super::*;
use tokio::sync::mpsc::UnboundedReceiver;

fn id(raw: &str) -> Identity {
    Identity::parse(raw).unwrap()
}

fn code(raw: &str) -> JoinCode {
    JoinCode::parse(raw).unwrap()
}

async fn connect(table: &RoutingTable, conn: ConnectionId) -> UnboundedReceiver<ServerMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    table.register(conn, tx).await;
    rx
}

fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

#[tokio::test]
async fn test_broadcast_reaches_only_the_room() {
    let table = RoutingTable::new();
    let mut a = connect(&table, 1).await;
    let mut b = connect(&table, 2).await;
    let mut other = connect(&table, 3).await;

    table.bind(1, &id("coord"), &code("1234")).await;
    table.bind(2, &id("p1"), &code("1234")).await;
    table.bind(3, &id("p2"), &code("9999")).await;

    let reached = table.broadcast(&code("1234"), &ServerMessage::Pong).await;

    assert_eq!(reached, 2);
    assert_eq!(drain(&mut a), vec![ServerMessage::Pong]);
    assert_eq!(drain(&mut b), vec![ServerMessage::Pong]);
    assert!(drain(&mut other).is_empty());
}

#[tokio::test]
async fn test_send_to_single_connection() {
    let table = RoutingTable::new();
    let mut a = connect(&table, 1).await;

    assert!(table.send(1, ServerMessage::SessionEnded).await);
    assert!(!table.send(42, ServerMessage::SessionEnded).await);
    assert_eq!(drain(&mut a), vec![ServerMessage::SessionEnded]);
}

#[tokio::test]
async fn test_rebinding_identity_detaches_old_connection() {
    let table = RoutingTable::new();
    let mut old = connect(&table, 1).await;
    let mut new = connect(&table, 2).await;

    table.bind(1, &id("p1"), &code("1234")).await;
    table.bind(2, &id("p1"), &code("1234")).await;

    assert!(table.binding(1).await.is_none());
    assert_eq!(
        table.binding(2).await,
        Some(Binding {
            identity: id("p1"),
            code: code("1234"),
        })
    );
    assert_eq!(table.room_size(&code("1234")).await, 1);

    table.broadcast(&code("1234"), &ServerMessage::Pong).await;
    assert!(drain(&mut old).is_empty());
    assert_eq!(drain(&mut new).len(), 1);

    // The stale connection going away must not report a disconnect
    assert!(table.unregister(1).await.is_none());
    assert!(table.unregister(2).await.is_some());
}

#[tokio::test]
async fn test_unregister_returns_current_binding() {
    let table = RoutingTable::new();
    let _rx = connect(&table, 7).await;
    table.bind(7, &id("coord"), &code("5555")).await;

    let binding = table.unregister(7).await.unwrap();
    assert_eq!(binding.identity, id("coord"));
    assert_eq!(binding.code, code("5555"));
    assert_eq!(table.connection_count().await, 0);
    assert!(table.room_codes().await.is_empty());
}

#[tokio::test]
async fn test_unbound_connection_unregisters_quietly() {
    let table = RoutingTable::new();
    let _rx = connect(&table, 1).await;
    assert!(table.unregister(1).await.is_none());
    assert!(table.unregister(1).await.is_none());
}

#[tokio::test]
async fn test_evict_room_unbinds_members_but_keeps_connections() {
    let table = RoutingTable::new();
    let _a = connect(&table, 1).await;
    let _b = connect(&table, 2).await;
    table.bind(1, &id("coord"), &code("1234")).await;
    table.bind(2, &id("p1"), &code("1234")).await;

    assert_eq!(table.evict_room(&code("1234")).await, 2);
    assert_eq!(table.evict_room(&code("1234")).await, 0);

    assert!(table.binding(1).await.is_none());
    assert!(table.binding(2).await.is_none());
    assert_eq!(table.connection_count().await, 2);
    assert_eq!(table.broadcast(&code("1234"), &ServerMessage::Pong).await, 0);
}

#[tokio::test]
async fn test_binding_to_new_session_leaves_old_room() {
    let table = RoutingTable::new();
    let _a = connect(&table, 1).await;
    table.bind(1, &id("coord"), &code("1234")).await;
    table.bind(1, &id("coord"), &code("4321")).await;

    assert_eq!(table.room_size(&code("1234")).await, 0);
    assert_eq!(table.room_size(&code("4321")).await, 1);
    assert_eq!(table.room_codes().await, vec![code("4321")]);
}

#[tokio::test]
async fn test_bind_ignores_unknown_connection() {
    let table = RoutingTable::new();
    table.bind(99, &id("ghost"), &code("1234")).await;
    assert!(table.room_codes().await.is_empty());
}
