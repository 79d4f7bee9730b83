//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use futures_util::{SinkExt, StreamExt};
use sketchsync_collab::client::{ClientConfig, ClientError, ConnectionState, SyncClient, SyncEvent};
use sketchsync_collab::protocol::{MessageType, PeerInfo, SyncMessage};
use sketchsync_collab::room_id::RoomId;
use sketchsync_collab::server::{ServerConfig, SyncServer};
use sketchsync_core::{
    ClientId, DocumentEngine, OpId, OpKind, Operation, PropValue, ShapeId, StateVector,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_server_on(port: u16) -> Arc<SyncServer> {
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::for_testing()
    };
    start_server_with(config).await
}

async fn start_server_with(config: ServerConfig) -> Arc<SyncServer> {
    let server = Arc::new(SyncServer::new(config).unwrap());
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    server
}

/// Start a server on a free port, return the port.
async fn start_test_server() -> u16 {
    let port = free_port().await;
    start_server_on(port).await;
    port
}

fn room(name: &str) -> RoomId {
    RoomId::parse(name).unwrap()
}

fn rect() -> BTreeMap<String, PropValue> {
    BTreeMap::from([("kind".to_string(), PropValue::from("rect"))])
}

/// Connected, caught-up client plus its event stream.
async fn join(port: u16, room_id: &RoomId, name: &str) -> (Arc<SyncClient>, mpsc::Receiver<SyncEvent>) {
    let config = ClientConfig::for_testing(format!("ws://127.0.0.1:{port}"));
    let mut client = SyncClient::new(PeerInfo::new(name), room_id.clone(), config);
    let events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    timeout(Duration::from_secs(5), client.wait_connected())
        .await
        .expect("client should sync");
    (Arc::new(client), events)
}

async fn next_matching<F>(events: &mut mpsc::Receiver<SyncEvent>, mut pred: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn replica_state(client: &SyncClient) -> (serde_json::Value, StateVector) {
    let engine = client.engine().lock().await;
    (engine.to_json(), engine.state_vector().clone())
}

async fn wait_converged(a: &SyncClient, b: &SyncClient) {
    timeout(Duration::from_secs(5), async {
        loop {
            if replica_state(a).await == replica_state(b).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("replicas should converge");
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_connects_and_syncs() {
    let port = start_test_server().await;
    let config = ClientConfig::for_testing(format!("ws://127.0.0.1:{port}"));
    let mut client = SyncClient::new(PeerInfo::new("Alice"), room("solo"), config);
    let mut events = client.take_event_rx().unwrap();

    client.connect().await.unwrap();

    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(SyncEvent::Connected)) => {}
        other => panic!("Expected Connected event, got {other:?}"),
    }
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(SyncEvent::Synced { applied: 0 })) => {}
        other => panic!("Expected empty catch-up, got {other:?}"),
    }
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_peer_joined_and_left_events() {
    let port = start_test_server().await;
    let room_id = room("lobby");

    let (alice, mut alice_events) = join(port, &room_id, "Alice").await;
    let (bob, mut bob_events) = join(port, &room_id, "Bob").await;

    let bob_id = bob.peer_info().peer_id;
    let event = next_matching(&mut alice_events, |e| matches!(e, SyncEvent::PeerJoined(_))).await;
    match event {
        SyncEvent::PeerJoined(info) => {
            assert_eq!(info.peer_id, bob_id);
            assert_eq!(info.name, "Bob");
        }
        _ => unreachable!(),
    }

    // Bob learns about peers already in the room
    let event = next_matching(&mut bob_events, |e| matches!(e, SyncEvent::PeerJoined(_))).await;
    match event {
        SyncEvent::PeerJoined(info) => assert_eq!(info.peer_id, alice.peer_info().peer_id),
        _ => unreachable!(),
    }

    bob.disconnect().await;
    let event = next_matching(&mut alice_events, |e| matches!(e, SyncEvent::PeerLeft(_))).await;
    match event {
        SyncEvent::PeerLeft(id) => assert_eq!(id, bob_id),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_edits_reach_other_client() {
    let port = start_test_server().await;
    let room_id = room("edits");
    let (alice, _alice_events) = join(port, &room_id, "Alice").await;
    let (bob, mut bob_events) = join(port, &room_id, "Bob").await;

    let shape = alice.create_shape(rect()).await.unwrap();
    alice.set_property(shape, "x", 12.5).await.unwrap();

    let event = next_matching(&mut bob_events, |e| matches!(e, SyncEvent::RemoteOperations { .. })).await;
    match event {
        SyncEvent::RemoteOperations { peer_id, ops } => {
            assert_eq!(peer_id, alice.peer_info().peer_id);
            assert_eq!(ops[0].shape(), shape);
        }
        _ => unreachable!(),
    }

    wait_converged(&alice, &bob).await;
    let view = bob.shape(shape).await.unwrap();
    assert_eq!(view.get("x"), Some(&PropValue::from(12.5)));
    assert_eq!(view.get("kind"), Some(&PropValue::from("rect")));
}

#[tokio::test]
async fn test_concurrent_writes_converge_to_highest_stamp() {
    let port = start_test_server().await;
    let room_id = room("race");
    let (alice, _a) = join(port, &room_id, "Alice").await;
    let (bob, _b) = join(port, &room_id, "Bob").await;

    let shape = alice.create_shape(rect()).await.unwrap();
    wait_converged(&alice, &bob).await;

    // Both writes carry counter 2; the client id breaks the tie
    let (a, b) = tokio::join!(
        alice.set_property(shape, "fill", "red"),
        bob.set_property(shape, "fill", "blue"),
    );
    a.unwrap();
    b.unwrap();
    wait_converged(&alice, &bob).await;

    let expected = if alice.peer_info().peer_id > bob.peer_info().peer_id {
        "red"
    } else {
        "blue"
    };
    let fill = alice.shape(shape).await.unwrap().get("fill").cloned();
    assert_eq!(fill, Some(PropValue::from(expected)));
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let port = start_test_server().await;
    let room_id = room("history");
    let (alice, _a) = join(port, &room_id, "Alice").await;

    let first = alice.create_shape(rect()).await.unwrap();
    let second = alice.create_shape(rect()).await.unwrap();
    alice.delete_shape(first).await.unwrap();

    // Make sure the server has everything before Bob joins
    tokio::time::sleep(Duration::from_millis(100)).await;

    let config = ClientConfig::for_testing(format!("ws://127.0.0.1:{port}"));
    let mut bob = SyncClient::new(PeerInfo::new("Bob"), room_id.clone(), config);
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();

    let event = next_matching(&mut bob_events, |e| matches!(e, SyncEvent::Synced { .. })).await;
    assert!(matches!(event, SyncEvent::Synced { applied: 3 }));
    assert!(bob.shape(first).await.is_none());
    assert!(bob.shape(second).await.is_some());
}

#[tokio::test]
async fn test_offline_edits_delivered_on_reconnect() {
    let port = start_test_server().await;
    let room_id = room("offline");
    let (alice, _a) = join(port, &room_id, "Alice").await;
    let (bob, mut bob_events) = join(port, &room_id, "Bob").await;

    let shape = alice.create_shape(rect()).await.unwrap();
    wait_converged(&alice, &bob).await;

    alice.disconnect().await;
    timeout(Duration::from_secs(2), alice.wait_disconnected())
        .await
        .unwrap();

    // Edits while offline stay local
    alice.set_property(shape, "x", 99.0).await.unwrap();
    let extra = alice.create_shape(rect()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(bob.shape(extra).await.is_none());

    // Bob keeps editing meanwhile
    bob.set_property(shape, "y", 7.0).await.unwrap();

    alice.connect().await.unwrap();
    timeout(Duration::from_secs(5), alice.wait_connected())
        .await
        .unwrap();

    next_matching(&mut bob_events, |e| match e {
        SyncEvent::RemoteOperations { ops, .. } => ops.iter().any(|op| op.shape() == extra),
        _ => false,
    })
    .await;
    wait_converged(&alice, &bob).await;

    let view = alice.shape(shape).await.unwrap();
    assert_eq!(view.get("x"), Some(&PropValue::from(99.0)));
    assert_eq!(view.get("y"), Some(&PropValue::from(7.0)));
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let port = start_test_server().await;
    let (alice, _a) = join(port, &room("left"), "Alice").await;
    let (bob, mut bob_events) = join(port, &room("right"), "Bob").await;

    alice.create_shape(rect()).await.unwrap();
    let leaked = timeout(Duration::from_millis(300), async {
        loop {
            match bob_events.recv().await {
                Some(SyncEvent::RemoteOperations { .. }) => return true,
                Some(_) => continue,
                None => return false,
            }
        }
    })
    .await;
    assert!(leaked.is_err(), "Ops must not cross rooms");
    assert!(bob.shapes().await.is_empty());
}

#[tokio::test]
async fn test_reconnect_loop_waits_for_server() {
    let port = free_port().await;
    let config = ClientConfig::for_testing(format!("ws://127.0.0.1:{port}"));
    let client = Arc::new(SyncClient::new(PeerInfo::new("Patient"), room("later"), config));

    let runner = client.clone();
    let handle = tokio::spawn(async move { runner.run_with_reconnect().await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_ne!(client.connection_state(), ConnectionState::Connected);

    start_server_on(port).await;
    timeout(Duration::from_secs(5), client.wait_connected())
        .await
        .expect("client should connect once the server is up");

    client.disconnect().await;
    let result = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(result.is_ok());
}

// ─── Raw protocol ───────────────────────────────────────────────────

async fn raw_connect(
    port: u16,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    ws
}

async fn next_message<S>(ws: &mut S) -> Message
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .expect("websocket error");
        if !matches!(msg, Message::Ping(_) | Message::Pong(_)) {
            return msg;
        }
    }
}

fn decode(msg: Message) -> SyncMessage {
    match msg {
        Message::Binary(data) => SyncMessage::decode(&data).unwrap(),
        other => panic!("expected binary frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_raw_join_handshake() {
    let port = start_test_server().await;
    let mut ws = raw_connect(port).await;
    let info = PeerInfo::new("Raw");

    let join = SyncMessage::join(&info, &room("raw"), &StateVector::new()).unwrap();
    ws.send(Message::Binary(join.encode().unwrap().into())).await.unwrap();

    let reply = decode(next_message(&mut ws).await);
    assert_eq!(reply.msg_type, MessageType::SyncStep2);
    let catch_up = reply.catch_up().unwrap();
    assert!(catch_up.ops.is_empty());

    let ping = SyncMessage::ping(info.peer_id, &room("raw"));
    ws.send(Message::Binary(ping.encode().unwrap().into())).await.unwrap();
    assert_eq!(decode(next_message(&mut ws).await).msg_type, MessageType::Pong);
}

#[tokio::test]
async fn test_garbage_before_join_closes_connection() {
    let port = start_test_server().await;
    let mut ws = raw_connect(port).await;

    ws.send(Message::Binary(vec![0xFF, 0x00, 0x13].into())).await.unwrap();
    match next_message(&mut ws).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Invalid),
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_delta_before_join_rejected() {
    let port = start_test_server().await;
    let mut ws = raw_connect(port).await;

    let delta = SyncMessage::delta(ClientId::new(), &room("nojoin"), &[]).unwrap();
    ws.send(Message::Binary(delta.encode().unwrap().into())).await.unwrap();

    let reply = decode(next_message(&mut ws).await);
    assert_eq!(reply.msg_type, MessageType::Error);
    assert!(reply.error_reason().unwrap().contains("Unexpected message"));
    match next_message(&mut ws).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Policy),
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_operation_rejected_room_unaffected() {
    let port = start_test_server().await;
    let room_id = room("strict");
    let (observer, _events) = join(port, &room_id, "Observer").await;

    let mut ws = raw_connect(port).await;
    let info = PeerInfo::new("Vandal");
    let join = SyncMessage::join(&info, &room_id, &StateVector::new()).unwrap();
    ws.send(Message::Binary(join.encode().unwrap().into())).await.unwrap();
    assert_eq!(decode(next_message(&mut ws).await).msg_type, MessageType::SyncStep2);

    let bad = Operation::new(
        OpId::new(info.peer_id, 1),
        OpKind::SetProperty {
            shape: ShapeId(OpId::new(info.peer_id, 1)),
            key: String::new(),
            value: PropValue::Null,
        },
    );
    let delta = SyncMessage::delta(info.peer_id, &room_id, &[bad]).unwrap();
    ws.send(Message::Binary(delta.encode().unwrap().into())).await.unwrap();

    let error = loop {
        let msg = decode(next_message(&mut ws).await);
        if msg.msg_type == MessageType::Error {
            break msg;
        }
    };
    assert!(error.error_reason().unwrap().contains("Invalid operation"));
    assert!(matches!(next_message(&mut ws).await, Message::Close(Some(_))));

    // The observer's room keeps working
    observer.create_shape(rect()).await.unwrap();
    assert_eq!(observer.engine().lock().await.op_count(), 1);
    assert_eq!(observer.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_text_frame_before_join_closes_connection() {
    let port = start_test_server().await;
    let mut ws = raw_connect(port).await;

    ws.send(Message::Text("hello".into())).await.unwrap();
    match next_message(&mut ws).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Invalid),
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_text_frame_after_join_rejected() {
    let port = start_test_server().await;
    let mut ws = raw_connect(port).await;
    let info = PeerInfo::new("Texter");
    let join = SyncMessage::join(&info, &room("text"), &StateVector::new()).unwrap();
    ws.send(Message::Binary(join.encode().unwrap().into())).await.unwrap();
    assert_eq!(decode(next_message(&mut ws).await).msg_type, MessageType::SyncStep2);

    ws.send(Message::Text("{\"op\":\"create\"}".into())).await.unwrap();
    let error = loop {
        let msg = decode(next_message(&mut ws).await);
        if msg.msg_type == MessageType::Error {
            break msg;
        }
    };
    assert!(error.error_reason().unwrap().contains("Only binary frames"));
    match next_message(&mut ws).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Policy),
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_sync_step1_returns_missing_ops() {
    let port = start_test_server().await;
    let room_id = room("step1");
    let (alice, _a) = join(port, &room_id, "Alice").await;
    for _ in 0..3 {
        alice.create_shape(rect()).await.unwrap();
    }
    let alice_id = alice.peer_info().peer_id;

    let mut ws = raw_connect(port).await;
    let info = PeerInfo::new("Raw");
    let join = SyncMessage::join(&info, &room_id, &StateVector::new()).unwrap();
    ws.send(Message::Binary(join.encode().unwrap().into())).await.unwrap();
    let first = decode(next_message(&mut ws).await);
    assert_eq!(first.msg_type, MessageType::SyncStep2);
    assert_eq!(first.catch_up().unwrap().ops.len(), 3);

    let mut have = StateVector::new();
    have.set(alice_id, 1);
    let step1 = SyncMessage::sync_step1(info.peer_id, &room_id, &have).unwrap();
    ws.send(Message::Binary(step1.encode().unwrap().into())).await.unwrap();

    let reply = loop {
        let msg = decode(next_message(&mut ws).await);
        if msg.msg_type == MessageType::SyncStep2 {
            break msg;
        }
    };
    let catch_up = reply.catch_up().unwrap();
    let counters: Vec<u64> = catch_up.ops.iter().map(|op| op.id.counter).collect();
    assert_eq!(counters, vec![2, 3]);
    assert_eq!(catch_up.vector.get(&alice_id), 3);
}

#[tokio::test]
async fn test_client_resync() {
    let port = start_test_server().await;
    let room_id = room("resync");
    let (alice, _a) = join(port, &room_id, "Alice").await;
    let (bob, mut bob_events) = join(port, &room_id, "Bob").await;

    alice.create_shape(rect()).await.unwrap();
    // Everything before the delta, including the join's catch-up, is consumed
    next_matching(&mut bob_events, |e| matches!(e, SyncEvent::RemoteOperations { .. })).await;

    bob.resync().await.unwrap();
    match next_matching(&mut bob_events, |e| matches!(e, SyncEvent::Synced { .. })).await {
        SyncEvent::Synced { applied } => assert_eq!(applied, 0),
        other => panic!("unexpected event {other:?}"),
    }
    wait_converged(&alice, &bob).await;
}

#[tokio::test]
async fn test_lagging_peer_is_resynced() {
    let port = free_port().await;
    let server = start_server_with(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 1,
        ..ServerConfig::for_testing()
    })
    .await;
    let room_id = room("lag");
    let (bob, _b) = join(port, &room_id, "Bob").await;

    let mut ws = raw_connect(port).await;
    let info = PeerInfo::new("Burst");
    let join = SyncMessage::join(&info, &room_id, &StateVector::new()).unwrap();
    ws.send(Message::Binary(join.encode().unwrap().into())).await.unwrap();
    assert_eq!(decode(next_message(&mut ws).await).msg_type, MessageType::SyncStep2);

    // Written back to back so the server reads them in one go
    let mut engine = DocumentEngine::new(info.peer_id);
    let create = engine.create_shape(rect()).unwrap();
    let shape = create.shape();
    let mut ops = vec![create];
    for i in 1..50 {
        ops.push(engine.set_property(shape, "x", i as f64).unwrap());
    }
    for op in &ops {
        let delta = SyncMessage::delta(info.peer_id, &room_id, std::slice::from_ref(op)).unwrap();
        ws.feed(Message::Binary(delta.encode().unwrap().into())).await.unwrap();
    }
    ws.flush().await.unwrap();

    timeout(Duration::from_secs(5), async {
        while bob.engine().lock().await.op_count() < 50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("lagging peer should catch up");
    assert_eq!(bob.engine().lock().await.to_json(), engine.to_json());
    assert!(server.stats().await.lag_resyncs >= 1);
}

#[tokio::test]
async fn test_reused_peer_id_with_fresh_replica_rejected() {
    let port = free_port().await;
    // Presence expiry also reports PeerLeft; keep it out of the way
    start_server_with(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        presence_timeout_secs: 30,
        ..ServerConfig::for_testing()
    })
    .await;
    let room_id = room("reuse");
    let (_observer, mut observer_events) = join(port, &room_id, "Observer").await;

    let info = PeerInfo::new("Alice");
    let config = ClientConfig::for_testing(format!("ws://127.0.0.1:{port}"));
    let mut alice = SyncClient::new(info.clone(), room_id.clone(), config.clone());
    let _alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    timeout(Duration::from_secs(5), alice.wait_connected()).await.unwrap();
    alice.create_shape(rect()).await.unwrap();
    next_matching(&mut observer_events, |e| matches!(e, SyncEvent::RemoteOperations { .. })).await;

    alice.disconnect().await;
    next_matching(&mut observer_events, |e| {
        matches!(e, SyncEvent::PeerLeft(id) if *id == info.peer_id)
    })
    .await;

    // Same id, empty engine: its next op would reuse counter 1
    let mut again = SyncClient::new(info, room_id.clone(), config);
    let mut events = again.take_event_rx().unwrap();
    again.connect().await.unwrap();
    match next_matching(&mut events, |e| matches!(e, SyncEvent::Rejected(_))).await {
        SyncEvent::Rejected(reason) => assert!(reason.contains("Stale replica"), "{reason}"),
        other => panic!("unexpected event {other:?}"),
    }
    timeout(Duration::from_secs(5), again.wait_disconnected()).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_bulk_edits_do_not_stall() {
    let port = start_test_server().await;
    let room_id = room("bulk");
    let (alice, mut alice_events) = join(port, &room_id, "Alice").await;
    let (bob, mut bob_events) = join(port, &room_id, "Bob").await;
    tokio::spawn(async move { while alice_events.recv().await.is_some() {} });
    tokio::spawn(async move { while bob_events.recv().await.is_some() {} });

    async fn scribble(client: Arc<SyncClient>) -> Vec<Result<(), ClientError>> {
        let shape = client.create_shape(rect()).await.unwrap();
        let strokes: Vec<_> = (0..200)
            .map(|i| {
                let path: Vec<(f64, f64)> = (0..2_000).map(|p| (i as f64, p as f64)).collect();
                client.set_property(shape, "path", path)
            })
            .collect();
        futures_util::future::join_all(strokes).await
    }

    let (a, b) = timeout(Duration::from_secs(30), async {
        tokio::join!(scribble(alice.clone()), scribble(bob.clone()))
    })
    .await
    .expect("edits should not stall");
    assert!(a.iter().chain(&b).all(Result::is_ok));

    timeout(Duration::from_secs(30), async {
        loop {
            if replica_state(&alice).await == replica_state(&bob).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("replicas should converge");
    assert_eq!(alice.engine().lock().await.op_count(), 402);
}
