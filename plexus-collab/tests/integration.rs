//! Integration tests for the sync server over real WebSocket connections.

mod common;

use std::sync::Arc;

use common::*;
use plexus_collab::auth::{Role, StaticTokens};
use plexus_collab::protocol::{
    AwarenessEntry, AwarenessUpdate, CustomMessage, ErrorCode, Frame, MessageKind, Notification, SyncMessage,
};
use plexus_collab::server::{ServerConfig, SyncServer};
use tokio::time::Duration;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

#[tokio::test]
async fn test_server_accepts_connections() {
    let (port, _server) = start_test_server().await;
    let result = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}")).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_first_frame_must_be_auth() {
    let (port, _server) = start_test_server().await;
    let mut ws = connect(port).await;

    send(&mut ws, &Frame::sync(&SyncMessage::Update(element_update(1, "S1")))).await;
    let error = recv(&mut ws).await.as_error().unwrap();
    assert_eq!(error.code, ErrorCode::NotAuthenticated);
    assert_closed(&mut ws).await;
}

#[tokio::test]
async fn test_invalid_token_rejected() {
    let server = SyncServer::new(ServerConfig::for_testing(0))
        .unwrap()
        .with_authenticator(Arc::new(StaticTokens::new().with_token("s3cret", "alice", Role::Owner)));
    let (port, _server) = start_with(Arc::new(server)).await;

    let mut ws = connect(port).await;
    send_auth(&mut ws, Uuid::new_v4(), "alice", "wrong").await;
    assert_eq!(recv(&mut ws).await.as_error().unwrap().code, ErrorCode::Unauthorized);
    assert_closed(&mut ws).await;

    let mut ws = connect(port).await;
    send_auth(&mut ws, Uuid::new_v4(), "alice", "s3cret").await;
    match recv(&mut ws).await.as_notification().unwrap() {
        Notification::Authenticated { role, .. } => assert_eq!(role, Role::Owner),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_update_relayed_without_echo() {
    let (port, _server) = start_test_server().await;
    let doc = Uuid::new_v4();
    let (mut alice, _) = join(port, doc, "alice").await;
    let (mut bob, _) = join(port, doc, "bob").await;
    let (mut carol, _) = join(port, doc, "carol").await;

    let update = element_update(11, "S1");
    send(&mut alice, &Frame::sync(&SyncMessage::Update(update.clone()))).await;

    for ws in [&mut bob, &mut carol] {
        let frame = recv_kind(ws, MessageKind::Sync).await;
        assert_eq!(frame.as_sync().unwrap(), SyncMessage::Update(update.clone()));
    }
    // alice only sees presence notifications for bob and carol
    let first = recv(&mut alice).await.as_notification().unwrap();
    assert!(matches!(first, Notification::UserJoined { .. }));
    let second = recv(&mut alice).await.as_notification().unwrap();
    assert!(matches!(second, Notification::UserJoined { .. }));
    assert_silent(&mut alice, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_bootstrap_reaches_room_state_vector() {
    let (port, _server) = start_test_server().await;
    let doc = Uuid::new_v4();
    let (mut alice, _) = join(port, doc, "alice").await;
    send(&mut alice, &Frame::sync(&SyncMessage::Update(element_update(21, "S1")))).await;
    send(&mut alice, &Frame::sync(&SyncMessage::Update(element_update(22, "S2")))).await;
    // round trip so both updates are applied before bob joins
    send(&mut alice, &Frame::custom(&CustomMessage::Ping { ts: 1 }).unwrap()).await;
    recv_kind(&mut alice, MessageKind::Custom).await;

    let (mut bob, server_sv) = join(port, doc, "bob").await;
    let local = Doc::new();
    let local_sv = local.transact().state_vector().encode_v1();
    send(&mut bob, &Frame::sync(&SyncMessage::Step1(local_sv))).await;

    let diff = match recv_kind(&mut bob, MessageKind::Sync).await.as_sync().unwrap() {
        SyncMessage::Step2(diff) => diff,
        other => panic!("expected step2, got {other:?}"),
    };
    local
        .transact_mut()
        .apply_update(Update::decode_v1(&diff).unwrap())
        .unwrap();

    let ours = local.transact().state_vector();
    assert_eq!(ours, StateVector::decode_v1(&server_sv).unwrap());
    assert_eq!(keys_of(&local.transact().encode_state_as_update_v1(&StateVector::default())), vec!["S1", "S2"]);
}

#[tokio::test]
async fn test_ping_pong() {
    let (port, _server) = start_test_server().await;
    let (mut ws, _) = join(port, Uuid::new_v4(), "alice").await;
    send(&mut ws, &Frame::custom(&CustomMessage::Ping { ts: 42 }).unwrap()).await;
    let reply = recv_kind(&mut ws, MessageKind::Custom).await.as_custom().unwrap();
    assert_eq!(reply, CustomMessage::Pong { ts: 42 });
}

#[tokio::test]
async fn test_viewer_cannot_write() {
    let server = SyncServer::new(ServerConfig::for_testing(0)).unwrap().with_authenticator(Arc::new(
        StaticTokens::new()
            .with_token("w", "writer", Role::Editor)
            .with_token("r", "reader", Role::Viewer),
    ));
    let (port, _server) = start_with(Arc::new(server)).await;
    let doc = Uuid::new_v4();

    let mut writer = connect(port).await;
    send_auth(&mut writer, doc, "writer", "w").await;
    recv(&mut writer).await;
    recv(&mut writer).await;
    let mut reader = connect(port).await;
    send_auth(&mut reader, doc, "reader", "r").await;
    recv(&mut reader).await;
    recv(&mut reader).await;

    send(&mut reader, &Frame::sync(&SyncMessage::Update(element_update(31, "X")))).await;
    assert_eq!(recv_kind(&mut reader, MessageKind::Error).await.as_error().unwrap().code, ErrorCode::ReadOnly);

    // the writer saw the reader join but never the update
    recv_kind(&mut writer, MessageKind::Notification).await;
    assert_silent(&mut writer, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_lock_round_trip() {
    let (port, _server) = start_test_server().await;
    let doc = Uuid::new_v4();
    let (mut alice, _) = join(port, doc, "alice").await;
    let (mut bob, _) = join(port, doc, "bob").await;
    recv(&mut alice).await; // bob joined

    send(&mut alice, &Frame::custom(&CustomMessage::Lock { element_id: "S1".into() }).unwrap()).await;
    let expected = Notification::LockChanged { element_id: "S1".into(), holder: Some("alice".into()) };
    assert_eq!(recv(&mut bob).await.as_notification().unwrap(), expected);
    assert_eq!(recv(&mut alice).await.as_notification().unwrap(), expected);

    send(&mut bob, &Frame::custom(&CustomMessage::Lock { element_id: "S1".into() }).unwrap()).await;
    assert_eq!(recv(&mut bob).await.as_error().unwrap().code, ErrorCode::LockHeld);

    drop(alice);
    let released = recv(&mut bob).await.as_notification().unwrap();
    assert_eq!(released, Notification::LockChanged { element_id: "S1".into(), holder: None });
    assert_eq!(
        recv(&mut bob).await.as_notification().unwrap(),
        Notification::UserLeft { user_id: "alice".into() }
    );
}

#[tokio::test]
async fn test_comment_broadcast_to_all() {
    let (port, _server) = start_test_server().await;
    let doc = Uuid::new_v4();
    let (mut alice, _) = join(port, doc, "alice").await;
    let (mut bob, _) = join(port, doc, "bob").await;
    recv(&mut alice).await;

    let comment = CustomMessage::Comment { element_id: "S1".into(), text: "  needs a label ".into() };
    send(&mut bob, &Frame::custom(&comment).unwrap()).await;
    for ws in [&mut alice, &mut bob] {
        match recv(ws).await.as_notification().unwrap() {
            Notification::CommentAdded { comment } => {
                assert_eq!(comment.text, "needs a label");
                assert_eq!(comment.author_id, "bob");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_oversize_frame_rejected() {
    let (port, server) = start_test_server().await;
    let (mut ws, _) = join(port, Uuid::new_v4(), "alice").await;
    let huge = vec![0u8; server.config().max_frame_size + 1];
    send(&mut ws, &Frame::sync(&SyncMessage::Update(huge))).await;
    assert_eq!(recv(&mut ws).await.as_error().unwrap().code, ErrorCode::FrameTooLarge);

    // connection stays usable
    send(&mut ws, &Frame::custom(&CustomMessage::Ping { ts: 7 }).unwrap()).await;
    assert_eq!(recv(&mut ws).await.as_custom().unwrap(), CustomMessage::Pong { ts: 7 });
}

#[tokio::test]
async fn test_presence_snapshot_on_join_and_removal_on_leave() {
    let (port, _server) = start_test_server().await;
    let doc = Uuid::new_v4();
    let (mut alice, _) = join(port, doc, "alice").await;
    let update = AwarenessUpdate {
        entries: vec![AwarenessEntry { client_id: 501, clock: 1, state: Some(r#"{"x":10}"#.into()) }],
    };
    send(&mut alice, &Frame::awareness(&update).unwrap()).await;
    send(&mut alice, &Frame::custom(&CustomMessage::Ping { ts: 1 }).unwrap()).await;
    recv_kind(&mut alice, MessageKind::Custom).await;

    let (mut bob, _) = join(port, doc, "bob").await;
    let snapshot = recv(&mut bob).await.as_awareness().unwrap();
    assert_eq!(snapshot, update);

    drop(alice);
    let removal = recv_kind(&mut bob, MessageKind::Awareness).await.as_awareness().unwrap();
    assert_eq!(removal.entries.len(), 1);
    assert_eq!(removal.entries[0].client_id, 501);
    assert_eq!(removal.entries[0].state, None);
}

#[tokio::test]
async fn test_stats_and_room_lifecycle() {
    let (port, server) = start_test_server().await;
    let doc = Uuid::new_v4();
    let (mut alice, _) = join(port, doc, "alice").await;
    send(&mut alice, &Frame::custom(&CustomMessage::Ping { ts: 1 }).unwrap()).await;
    recv(&mut alice).await;

    let stats = server.stats().await;
    assert_eq!(stats.active_rooms, 1);
    assert_eq!(stats.active_connections, 1);
    assert!(stats.total_messages >= 2);
    assert_eq!(stats.active_sessions, 1);

    drop(alice);
    for _ in 0..100 {
        if server.stats().await.active_rooms == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stats = server.stats().await;
    assert_eq!(stats.active_rooms, 0);
    assert_eq!(stats.active_sessions, 0);
    assert_eq!(stats.rooms_opened, 1);
}
