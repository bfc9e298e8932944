use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use scenesync_common::protocol::ws::{decode_message, decode_payload, encode_message, encode_payload, WsMessage};
use scenesync_realtime::config::RoomConfig;
use scenesync_realtime::coordination::{CoordinationStore, MemoryCoordinationStore};
use scenesync_realtime::db::{MemorySnapshotStore, SnapshotStore};
use scenesync_realtime::gateway::{build_router, AppState};
use scenesync_realtime::rate_limit::{RateLimitConfig, RateLimiter};
use scenesync_realtime::registry::{RoomRegistry, ShutdownReport};
use scenesync_realtime::room::doc::SceneDoc;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    registry: Arc<RoomRegistry>,
    snapshots: Arc<MemorySnapshotStore>,
    coordination: Arc<MemoryCoordinationStore>,
}

async fn start_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");

    let snapshots = Arc::new(MemorySnapshotStore::default());
    let coordination = Arc::new(MemoryCoordinationStore::default());
    let snapshot_store = SnapshotStore::Memory(Arc::clone(&snapshots));
    let registry = Arc::new(RoomRegistry::new(
        snapshot_store.clone(),
        RoomConfig { drain_grace: Duration::from_millis(200), ..RoomConfig::default() },
    ));
    let state = AppState::new(
        Arc::clone(&registry),
        Arc::new(RateLimiter::new(RateLimitConfig::default())),
        snapshot_store,
        CoordinationStore::Memory(Arc::clone(&coordination)),
    );
    let app = build_router(state.clone(), None);

    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .expect("realtime server should run");
    });

    TestServer { addr, state, registry, snapshots, coordination }
}

async fn connect(server: &TestServer, path: &str) -> ClientSocket {
    let (socket, _) = connect_async(format!("ws://{}{path}", server.addr))
        .await
        .expect("client should connect");
    socket
}

async fn recv_frame(socket: &mut ClientSocket) -> WsMessage {
    loop {
        let next = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame should arrive in time")
            .expect("socket should stay open")
            .expect("frame should be readable");
        match next {
            Message::Text(text) => {
                return decode_message(text.as_str()).expect("server frames should decode")
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected websocket message: {other:?}"),
        }
    }
}

async fn recv_kind(socket: &mut ClientSocket, kind: &str) -> WsMessage {
    loop {
        let frame = recv_frame(socket).await;
        if frame.kind() == kind {
            return frame;
        }
    }
}

async fn send_frame(socket: &mut ClientSocket, frame: &WsMessage) {
    let text = encode_message(frame).expect("frame should encode");
    socket.send(Message::text(text)).await.expect("frame should send");
}

async fn recv_close_code(socket: &mut ClientSocket) -> u16 {
    loop {
        let next = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("close should arrive in time");
        match next {
            Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
            Some(Ok(_)) => continue,
            other => panic!("expected a close frame, got {other:?}"),
        }
    }
}

async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition should hold in time");
}

#[tokio::test]
async fn two_clients_sync_updates_and_presence() {
    let server = start_server().await;

    let mut ada = connect(&server, "/ws/site-1/draft?userId=ada&name=Ada&color=%23f00").await;
    let WsMessage::Welcome { room_id, user_id, .. } = recv_frame(&mut ada).await else {
        panic!("first frame should be welcome");
    };
    assert_eq!(room_id, "site-1:draft");
    assert_eq!(user_id, "ada");
    assert_eq!(recv_frame(&mut ada).await.kind(), "sync_step2");
    assert_eq!(recv_frame(&mut ada).await.kind(), "sync_step1");
    assert!(matches!(recv_frame(&mut ada).await, WsMessage::Presence { peers } if peers.is_empty()));

    let mut bob = connect(&server, "/ws/site-1/draft?userId=bob").await;
    let WsMessage::Presence { peers } = recv_kind(&mut bob, "presence").await else { unreachable!() };
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].user_id, "ada");
    assert_eq!(peers[0].name.as_deref(), Some("Ada"));
    assert_eq!(peers[0].color.as_deref(), Some("#f00"));
    let WsMessage::Presence { peers } = recv_kind(&mut ada, "presence").await else { unreachable!() };
    assert_eq!(peers[0].user_id, "bob");

    let author = SceneDoc::with_client_id(11);
    let update = author.insert_text("scene", 0, "hello from ada");
    send_frame(&mut ada, &WsMessage::Update { update: encode_payload(&update) }).await;

    let WsMessage::Update { update } = recv_kind(&mut bob, "update").await else { unreachable!() };
    let replica = SceneDoc::new();
    replica.apply_update(&decode_payload(&update).expect("base64")).expect("update applies");
    assert_eq!(replica.text_string("scene"), "hello from ada");

    send_frame(&mut bob, &WsMessage::Awareness { state: serde_json::json!({ "cursor": [4, 2] }) }).await;
    let WsMessage::Presence { peers } = recv_kind(&mut ada, "presence").await else { unreachable!() };
    assert_eq!(peers[0].state["cursor"][0], 4);

    wait_for(|| async { server.coordination.connections_for("site-1:draft").await == 2 }).await;

    bob.close(None).await.expect("bob closes");
    let WsMessage::PresenceRemoved { .. } = recv_kind(&mut ada, "presence_removed").await else {
        unreachable!()
    };
    wait_for(|| async { server.coordination.connections_for("site-1:draft").await == 1 }).await;
    assert_eq!(
        server.registry.room_stats("site-1:draft").await.expect("room is live").connections,
        1
    );
}

#[tokio::test]
async fn late_joiner_catches_up_and_sync_step1_gets_a_diff() {
    let server = start_server().await;
    let mut ada = connect(&server, "/ws/site-1/v2?userId=ada").await;
    recv_kind(&mut ada, "presence").await;

    let author = SceneDoc::with_client_id(21);
    send_frame(&mut ada, &WsMessage::Update { update: encode_payload(&author.insert_text("scene", 0, "base")) })
        .await;
    // Round-trip a sync_step1 so the update is known to be applied.
    let client_view = SceneDoc::new();
    send_frame(
        &mut ada,
        &WsMessage::SyncStep1 { state_vector: encode_payload(&client_view.encode_state_vector()) },
    )
    .await;
    let WsMessage::SyncStep2 { update } = recv_kind(&mut ada, "sync_step2").await else { unreachable!() };
    client_view.apply_update(&decode_payload(&update).expect("base64")).expect("diff applies");
    assert_eq!(client_view.text_string("scene"), "base");

    let mut carol = connect(&server, "/ws/site-1/v2?userId=carol").await;
    recv_kind(&mut carol, "welcome").await;
    let WsMessage::SyncStep2 { update } = recv_frame(&mut carol).await else {
        panic!("full state should follow welcome");
    };
    let late = SceneDoc::new();
    late.apply_update(&decode_payload(&update).expect("base64")).expect("state applies");
    assert_eq!(late.text_string("scene"), "base");
}

#[tokio::test]
async fn malformed_frames_get_error_frames_and_socket_stays_open() {
    let server = start_server().await;
    let mut ada = connect(&server, "/ws/site-1/draft").await;
    let WsMessage::Welcome { user_id, .. } = recv_frame(&mut ada).await else {
        panic!("first frame should be welcome");
    };
    // Missing userId gets a generated one.
    assert!(uuid::Uuid::parse_str(&user_id).is_ok());
    recv_kind(&mut ada, "presence").await;

    ada.send(Message::text("{not json")).await.expect("send");
    let WsMessage::Error { code, .. } = recv_kind(&mut ada, "error").await else { unreachable!() };
    assert_eq!(code, "SYNC_INVALID_FRAME");

    send_frame(&mut ada, &WsMessage::Update { update: "***".into() }).await;
    let WsMessage::Error { code, .. } = recv_kind(&mut ada, "error").await else { unreachable!() };
    assert_eq!(code, "SYNC_INVALID_PAYLOAD");

    send_frame(&mut ada, &WsMessage::SyncStep1 { state_vector: encode_payload(&SceneDoc::new().encode_state_vector()) })
        .await;
    assert_eq!(recv_kind(&mut ada, "sync_step2").await.kind(), "sync_step2");
}

#[tokio::test]
async fn invalid_room_paths_are_rejected_before_handshake() {
    let server = start_server().await;
    for path in ["/ws/site-1", "/ws/site-1/v1/extra", "/ws/bad$site/v1"] {
        let error = connect_async(format!("ws://{}{path}", server.addr))
            .await
            .expect_err("handshake should be refused");
        match error {
            tokio_tungstenite::tungstenite::Error::Http(response) => {
                assert_eq!(response.status().as_u16(), 404, "{path}");
            }
            other => panic!("expected an HTTP error for {path}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn corrupt_snapshot_closes_joiner_with_4000() {
    let server = start_server().await;
    server.snapshots.put_raw("site-1", "broken", b"not a valid update".to_vec()).await;

    let mut ada = connect(&server, "/ws/site-1/broken").await;
    assert_eq!(recv_close_code(&mut ada).await, 4000);
    wait_for(|| async { server.coordination.connections_for("site-1:broken").await == 0 }).await;
}

#[tokio::test]
async fn drained_room_persists_edits_and_reloads_them() {
    let server = start_server().await;
    let mut ada = connect(&server, "/ws/site-1/draft").await;
    recv_kind(&mut ada, "presence").await;

    let author = SceneDoc::with_client_id(31);
    send_frame(&mut ada, &WsMessage::Update { update: encode_payload(&author.set_map_entry("nodes", "hero", "Hero")) })
        .await;
    ada.close(None).await.expect("close");

    wait_for(|| async { server.registry.room_count().await == 0 }).await;
    let stored = server.snapshots.snapshot("site-1", "draft").await.expect("snapshot persisted");
    let stored = SceneDoc::from_state(&stored.state).expect("stored state decodes");
    assert_eq!(stored.map_entry("nodes", "hero").as_deref(), Some("Hero"));

    let mut bob = connect(&server, "/ws/site-1/draft").await;
    recv_kind(&mut bob, "welcome").await;
    let WsMessage::SyncStep2 { update } = recv_frame(&mut bob).await else { unreachable!() };
    let reloaded = SceneDoc::new();
    reloaded.apply_update(&decode_payload(&update).expect("base64")).expect("apply");
    assert_eq!(reloaded.map_entry("nodes", "hero").as_deref(), Some("Hero"));
}

#[tokio::test]
async fn shutdown_flushes_rooms_and_closes_clients_with_1001() {
    let server = start_server().await;
    let mut ada = connect(&server, "/ws/site-2/live").await;
    recv_kind(&mut ada, "presence").await;

    let author = SceneDoc::with_client_id(41);
    send_frame(&mut ada, &WsMessage::Update { update: encode_payload(&author.insert_text("scene", 0, "unsaved")) })
        .await;
    send_frame(&mut ada, &WsMessage::SyncStep1 { state_vector: encode_payload(&SceneDoc::new().encode_state_vector()) })
        .await;
    recv_kind(&mut ada, "sync_step2").await;

    let report = server.registry.shutdown(Duration::from_secs(5)).await;
    assert_eq!(report, ShutdownReport { flushed: 1, failed: 0, timed_out: 0 });
    assert_eq!(recv_close_code(&mut ada).await, 1001);

    let stored = server.snapshots.snapshot("site-2", "live").await.expect("flushed on shutdown");
    assert_eq!(SceneDoc::from_state(&stored.state).expect("decode").text_string("scene"), "unsaved");
}

#[tokio::test]
async fn shutdown_returns_only_after_sockets_release_shared_counts() {
    let server = start_server().await;
    let mut ada = connect(&server, "/ws/site-3/live").await;
    recv_kind(&mut ada, "presence").await;
    let mut grace = connect(&server, "/ws/site-3/live").await;
    recv_kind(&mut grace, "presence").await;
    let mut linus = connect(&server, "/ws/site-4/live").await;
    recv_kind(&mut linus, "presence").await;
    wait_for(|| async { server.coordination.connections_for("site-3:live").await == 2 }).await;
    wait_for(|| async { server.coordination.connections_for("site-4:live").await == 1 }).await;

    // Same sequence as the binary once `serve` has returned.
    let report = server.state.shutdown(Duration::from_secs(5)).await;
    assert_eq!(report.flushed, 2);

    assert_eq!(server.coordination.connections_for("site-3:live").await, 0);
    assert_eq!(server.coordination.connections_for("site-4:live").await, 0);
    assert!(server.state.connections.is_empty());
    for socket in [&mut ada, &mut grace, &mut linus] {
        assert_eq!(recv_close_code(socket).await, 1001);
    }
}
