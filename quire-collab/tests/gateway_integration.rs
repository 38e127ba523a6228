//! Integration tests for the WebSocket gateway.
//!
//! These tests start a real server and talk to it with raw WebSocket
//! clients, checking authentication, routing, fan-out, and bad input.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use quire_collab::auth::{AuthenticatedUser, StaticSessionValidator};
use quire_collab::awareness::{AwarenessPayload, CursorPosition};
use quire_collab::document::{Origin, ReplicatedDocument};
use quire_collab::gateway::{ServerConfig, SyncServer};
use quire_collab::protocol::{encode_sync_frame, ControlEnvelope, ControlMessage, ErrorCode, Frame};
use quire_collab::room::RoomKey;
use quire_collab::session::ConnectionId;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(3);

fn validator() -> Arc<StaticSessionValidator> {
    Arc::new(
        StaticSessionValidator::new()
            .with_session("tok-alice", AuthenticatedUser::new("u-alice", "Alice"))
            .with_session("tok-bob", AuthenticatedUser::new("u-bob", "Bob")),
    )
}

/// Start a server on a free port.
async fn start_test_server() -> (SocketAddr, Arc<SyncServer>) {
    start_server_with(ServerConfig::default()).await
}

async fn start_server_with(config: ServerConfig) -> (SocketAddr, Arc<SyncServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(SyncServer::new(config, validator()).unwrap());
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (addr, server)
}

async fn connect(addr: SocketAddr, token: Option<&str>, query: &str) -> Ws {
    let mut request = format!("ws://{addr}/{query}").into_client_request().unwrap();
    if let Some(token) = token {
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
    }
    let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    ws
}

async fn next_message(ws: &mut Ws) -> Message {
    timeout(WAIT, ws.next())
        .await
        .expect("timed out waiting for a message")
        .expect("stream ended")
        .expect("websocket error")
}

/// Next control message of the given type; other traffic is skipped.
async fn expect_control(ws: &mut Ws, kind: &str) -> ControlEnvelope {
    loop {
        if let Message::Text(text) = next_message(ws).await {
            let envelope = ControlEnvelope::from_json(text.as_str()).unwrap();
            if envelope.message.kind() == kind {
                return envelope;
            }
        }
    }
}

/// Next binary frame; control traffic is skipped.
async fn expect_frame(ws: &mut Ws, want_sync: bool) -> Frame {
    loop {
        if let Message::Binary(data) = next_message(ws).await {
            let frame = Frame::decode(&data).unwrap();
            if matches!(frame, Frame::Sync(_)) == want_sync {
                return frame;
            }
        }
    }
}

async fn send_control(ws: &mut Ws, message: ControlMessage) {
    let json = ControlEnvelope::new(message).to_json().unwrap();
    ws.send(Message::Text(json.into())).await.unwrap();
}

/// Authenticate and join `project/file`. Returns our client id.
async fn join(ws: &mut Ws, project: &str, file: &str) -> String {
    let hello = expect_control(ws, "authenticated").await;
    let client_id = hello.client_id.unwrap();
    send_control(
        ws,
        ControlMessage::JoinRoom {
            project_id: Some(project.into()),
            file_id: Some(file.into()),
        },
    )
    .await;
    expect_control(ws, "room_joined").await;
    expect_frame(ws, true).await;
    client_id
}

/// Fail if a sync frame or cursor move arrives within `window`.
async fn assert_no_echo(ws: &mut Ws, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(Ok(msg))) = tokio::time::timeout_at(deadline, ws.next()).await {
        match msg {
            Message::Binary(data) => {
                assert!(
                    !matches!(Frame::decode(&data).unwrap(), Frame::Sync(_)),
                    "sender received its own update"
                );
            }
            Message::Text(text) => {
                let envelope = ControlEnvelope::from_json(text.as_str()).unwrap();
                assert_ne!(envelope.message.kind(), "cursor_move", "sender received its own cursor");
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_missing_token_closed_with_policy_violation() {
    let (addr, server) = start_test_server().await;
    let mut ws = connect(addr, None, "?projectId=p&fileId=f").await;

    match next_message(&mut ws).await {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expected close frame, got {other:?}"),
    }
    assert_eq!(server.registry().room_count(), 0);
}

#[tokio::test]
async fn test_invalid_token_closed_with_policy_violation() {
    let (addr, server) = start_test_server().await;
    let mut ws = connect(addr, Some("forged"), "").await;

    match next_message(&mut ws).await {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expected close frame, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.stats().rejected_connections, 1);
}

#[tokio::test]
async fn test_authenticated_identity_and_join() {
    let (addr, server) = start_test_server().await;
    let mut ws = connect(addr, Some("tok-alice"), "").await;

    let hello = expect_control(&mut ws, "authenticated").await;
    match hello.message {
        ControlMessage::Authenticated { user } => {
            assert_eq!(user, AuthenticatedUser::new("u-alice", "Alice"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(hello.client_id.is_some());

    send_control(
        &mut ws,
        ControlMessage::JoinRoom {
            project_id: Some("proj".into()),
            file_id: Some("main.rs".into()),
        },
    )
    .await;
    let joined = expect_control(&mut ws, "room_joined").await;
    assert_eq!(joined.room_id.as_deref(), Some("proj/main.rs"));
    assert!(matches!(joined.message, ControlMessage::RoomJoined { connections: 1, .. }));
    assert!(server.registry().contains(&RoomKey::new("proj", "main.rs").unwrap()));
}

#[tokio::test]
async fn test_join_uses_upgrade_query_context() {
    let (addr, server) = start_test_server().await;
    let mut ws = connect(addr, Some("tok-alice"), "?projectId=q&fileId=notes.md").await;
    expect_control(&mut ws, "authenticated").await;

    send_control(
        &mut ws,
        ControlMessage::JoinRoom {
            project_id: None,
            file_id: None,
        },
    )
    .await;
    let joined = expect_control(&mut ws, "room_joined").await;
    assert_eq!(joined.room_id.as_deref(), Some("q/notes.md"));
    assert_eq!(server.registry().room_count(), 1);
}

#[tokio::test]
async fn test_updates_fan_out_without_echo() {
    let (addr, _server) = start_test_server().await;
    let mut alice = connect(addr, Some("tok-alice"), "").await;
    let mut bob = connect(addr, Some("tok-bob"), "").await;
    let alice_id = join(&mut alice, "p", "f").await;
    join(&mut bob, "p", "f").await;

    let local = ReplicatedDocument::new();
    let delta = local.insert(0, "hello from alice").unwrap();
    alice
        .send(Message::Binary(encode_sync_frame(&delta).into()))
        .await
        .unwrap();

    let Frame::Sync(received) = expect_frame(&mut bob, true).await else {
        unreachable!()
    };
    let replica = ReplicatedDocument::new();
    replica
        .apply_delta(&received, Origin::Remote { from: ConnectionId::new() })
        .unwrap();
    assert_eq!(replica.content(), "hello from alice");

    send_control(
        &mut alice,
        ControlMessage::CursorMove {
            cursor: Some(CursorPosition::new(0, 5)),
        },
    )
    .await;
    let moved = expect_control(&mut bob, "cursor_move").await;
    assert_eq!(moved.client_id.as_deref(), Some(alice_id.as_str()));
    assert_eq!(
        moved.message,
        ControlMessage::CursorMove {
            cursor: Some(CursorPosition::new(0, 5))
        }
    );

    assert_no_echo(&mut alice, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_json_document_update_is_merged() {
    let (addr, server) = start_test_server().await;
    let mut alice = connect(addr, Some("tok-alice"), "").await;
    join(&mut alice, "p", "json").await;

    let local = ReplicatedDocument::new();
    let update = local.insert(0, "via json").unwrap();
    send_control(&mut alice, ControlMessage::DocumentUpdate { update }).await;

    let key = RoomKey::new("p", "json").unwrap();
    for _ in 0..50 {
        if server.registry().inspect(&key).await.map(|i| i.content) == Some("via json".into()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("update never reached the room");
}

#[tokio::test]
async fn test_presence_removed_on_disconnect() {
    let (addr, _server) = start_test_server().await;
    let mut alice = connect(addr, Some("tok-alice"), "").await;
    let mut bob = connect(addr, Some("tok-bob"), "").await;
    let alice_id = join(&mut alice, "p", "f").await;
    join(&mut bob, "p", "f").await;

    // Both present before bob leaves.
    loop {
        let Frame::Awareness(payload) = expect_frame(&mut alice, false).await else {
            unreachable!()
        };
        if AwarenessPayload::decode(&payload).unwrap().len() == 2 {
            break;
        }
    }

    bob.close(None).await.unwrap();

    loop {
        let Frame::Awareness(payload) = expect_frame(&mut alice, false).await else {
            unreachable!()
        };
        let presence = AwarenessPayload::decode(&payload).unwrap();
        if presence.len() == 1 {
            assert_eq!(presence.entries[0].client_id.to_string(), alice_id);
            assert_eq!(presence.entries[0].display_name, "Alice");
            break;
        }
    }
}

#[tokio::test]
async fn test_malformed_input_keeps_socket_usable() {
    let (addr, server) = start_test_server().await;
    let mut alice = connect(addr, Some("tok-alice"), "").await;

    // Not in a room yet.
    let local = ReplicatedDocument::new();
    let early = local.insert(0, "early").unwrap();
    alice
        .send(Message::Binary(encode_sync_frame(&early).into()))
        .await
        .unwrap();
    let err = expect_control(&mut alice, "error").await;
    assert_eq!(err.message.error_code(), Some(ErrorCode::NotInRoom));

    join(&mut alice, "p", "f").await;

    alice.send(Message::Text("{not json".into())).await.unwrap();
    let err = expect_control(&mut alice, "error").await;
    assert_eq!(err.message.error_code(), Some(ErrorCode::MalformedMessage));

    alice.send(Message::Binary(vec![9, 1, 2].into())).await.unwrap();
    let err = expect_control(&mut alice, "error").await;
    assert_eq!(err.message.error_code(), Some(ErrorCode::MalformedMessage));

    alice
        .send(Message::Binary(encode_sync_frame(&[0x01, 0x02, 0x03]).into()))
        .await
        .unwrap();
    let err = expect_control(&mut alice, "error").await;
    assert_eq!(err.message.error_code(), Some(ErrorCode::MergeFailed));
    assert_eq!(server.stats().rooms.merge_failures, 1);

    // Still usable. The early insert never reached the room, so send everything.
    local.insert(5, " and later").unwrap();
    let good = local.encode_full();
    alice
        .send(Message::Binary(encode_sync_frame(&good).into()))
        .await
        .unwrap();
    send_control(&mut alice, ControlMessage::SyncRequest { state_vector: None }).await;
    let response = expect_control(&mut alice, "sync_response").await;
    let ControlMessage::SyncResponse { update, .. } = response.message else {
        unreachable!()
    };
    let replica = ReplicatedDocument::from_update(&update, Origin::InitialSync).unwrap();
    assert_eq!(replica.content(), "early and later");
}

#[tokio::test]
async fn test_invalid_room_id_rejected() {
    let (addr, server) = start_test_server().await;
    let mut alice = connect(addr, Some("tok-alice"), "").await;
    expect_control(&mut alice, "authenticated").await;

    send_control(
        &mut alice,
        ControlMessage::JoinRoom {
            project_id: Some("bad id!".into()),
            file_id: Some("f".into()),
        },
    )
    .await;
    let err = expect_control(&mut alice, "error").await;
    assert_eq!(err.message.error_code(), Some(ErrorCode::InvalidRoom));
    assert_eq!(server.registry().room_count(), 0);

    send_control(
        &mut alice,
        ControlMessage::JoinRoom {
            project_id: Some("good".into()),
            file_id: Some("f".into()),
        },
    )
    .await;
    expect_control(&mut alice, "room_joined").await;
}

#[tokio::test]
async fn test_late_joiner_receives_full_state() {
    let (addr, _server) = start_test_server().await;
    let mut alice = connect(addr, Some("tok-alice"), "").await;
    join(&mut alice, "p", "late").await;

    let local = ReplicatedDocument::new();
    let delta = local.insert(0, "written before bob").unwrap();
    alice
        .send(Message::Binary(encode_sync_frame(&delta).into()))
        .await
        .unwrap();
    send_control(&mut alice, ControlMessage::SyncRequest { state_vector: None }).await;
    expect_control(&mut alice, "sync_response").await;

    let mut bob = connect(addr, Some("tok-bob"), "").await;
    expect_control(&mut bob, "authenticated").await;
    send_control(
        &mut bob,
        ControlMessage::JoinRoom {
            project_id: Some("p".into()),
            file_id: Some("late".into()),
        },
    )
    .await;
    let joined = expect_control(&mut bob, "room_joined").await;
    assert!(matches!(joined.message, ControlMessage::RoomJoined { connections: 2, .. }));
    let Frame::Sync(state) = expect_frame(&mut bob, true).await else {
        unreachable!()
    };
    let replica = ReplicatedDocument::from_update(&state, Origin::InitialSync).unwrap();
    assert_eq!(replica.content(), "written before bob");
}

#[tokio::test]
async fn test_oversized_message_closed_with_message_too_big() {
    let config = ServerConfig {
        max_frame_size: 1024,
        ..ServerConfig::default()
    };
    let (addr, server) = start_server_with(config).await;
    let mut ws = connect(addr, Some("tok-alice"), "").await;
    join(&mut ws, "proj", "big.md").await;

    let oversized = encode_sync_frame(&vec![0u8; 4096]);
    ws.send(Message::Binary(oversized.into())).await.unwrap();
    loop {
        match next_message(&mut ws).await {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 1009);
                break;
            }
            Message::Close(None) => panic!("closed without a code"),
            _ => continue,
        }
    }
    assert_eq!(server.stats().malformed_messages, 1);
    let key = RoomKey::new("proj", "big.md").unwrap();
    assert_eq!(server.registry().inspect(&key).await.unwrap().content, "");
}

#[tokio::test]
async fn test_ping_answered_once() {
    let (addr, _server) = start_test_server().await;
    let mut ws = connect(addr, Some("tok-alice"), "").await;
    join(&mut ws, "proj", "ping.md").await;

    ws.send(Message::Ping(b"still there?".to_vec().into())).await.unwrap();
    loop {
        if let Message::Pong(payload) = next_message(&mut ws).await {
            assert_eq!(&payload[..], b"still there?");
            break;
        }
    }
    let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
    while let Ok(Some(Ok(msg))) = tokio::time::timeout_at(deadline, ws.next()).await {
        assert!(!matches!(msg, Message::Pong(_)), "ping answered twice");
    }
}
