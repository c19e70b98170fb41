//! Shared helpers for the integration tests: a server on a free port and
//! a raw WebSocket client that speaks frames.

#![allow(dead_code)]

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use plexus_collab::protocol::{AuthRequest, Frame, MessageKind, Notification, SyncMessage};
use plexus_collab::server::{ServerConfig, SyncServer};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;
use yrs::{Doc, Map, ReadTxn, StateVector, Transact};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return the port and the server.
pub async fn start_server(config: ServerConfig) -> (u16, Arc<SyncServer>) {
    let server = Arc::new(SyncServer::new(config).unwrap());
    start_with(server).await
}

pub async fn start_with(server: Arc<SyncServer>) -> (u16, Arc<SyncServer>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.run_on(listener).await;
    });
    (port, server)
}

pub async fn start_test_server() -> (u16, Arc<SyncServer>) {
    start_server(ServerConfig::for_testing(0)).await
}

pub async fn connect(port: u16) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    ws
}

pub async fn send(ws: &mut Ws, frame: &Frame) {
    ws.send(Message::Binary(frame.encode().into())).await.unwrap();
}

pub async fn send_auth(ws: &mut Ws, document_id: Uuid, user_id: &str, token: &str) {
    let auth = AuthRequest {
        token: token.into(),
        user_id: user_id.into(),
        user_name: user_id.into(),
        document_id,
    };
    send(ws, &Frame::auth(&auth).unwrap()).await;
}

/// Next protocol frame, skipping transport pings.
pub async fn recv(ws: &mut Ws) -> Frame {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .unwrap();
        match msg {
            Message::Binary(data) => return Frame::decode(&data, usize::MAX).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message {other:?}"),
        }
    }
}

/// Next frame of `kind`, skipping others.
pub async fn recv_kind(ws: &mut Ws, kind: MessageKind) -> Frame {
    loop {
        let frame = recv(ws).await;
        if frame.kind == kind {
            return frame;
        }
    }
}

/// Nothing arrives within `wait`.
pub async fn assert_silent(ws: &mut Ws, wait: Duration) {
    if let Ok(Some(Ok(Message::Binary(data)))) = timeout(wait, ws.next()).await {
        panic!("unexpected frame {:?}", Frame::decode(&data, usize::MAX));
    }
}

/// The server closes the connection within two seconds.
pub async fn assert_closed(ws: &mut Ws) {
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert_eq!(closed, Ok(true));
}

/// Authenticate and consume the bootstrap frames. Returns the server's
/// state vector from its sync-step1.
pub async fn join(port: u16, document_id: Uuid, user_id: &str) -> (Ws, Vec<u8>) {
    let mut ws = connect(port).await;
    send_auth(&mut ws, document_id, user_id, "").await;
    match recv(&mut ws).await.as_notification().unwrap() {
        Notification::Authenticated { user_id: id, .. } => assert_eq!(id, user_id),
        other => panic!("expected authenticated, got {other:?}"),
    }
    let sv = match recv(&mut ws).await.as_sync().unwrap() {
        SyncMessage::Step1(sv) => sv,
        other => panic!("expected step1, got {other:?}"),
    };
    (ws, sv)
}

/// A self-contained update writing `key` into the `elements` map.
pub fn element_update(client_id: u64, key: &str) -> Vec<u8> {
    let doc = Doc::with_client_id(client_id);
    let map = doc.get_or_insert_map("elements");
    map.insert(&mut doc.transact_mut(), key, "shape");
    let update = doc.transact().encode_state_as_update_v1(&StateVector::default());
    update
}

pub fn keys_of(state: &[u8]) -> Vec<String> {
    use yrs::updates::decoder::Decode;
    let doc = Doc::new();
    doc.transact_mut()
        .apply_update(yrs::Update::decode_v1(state).unwrap())
        .unwrap();
    let map = doc.get_or_insert_map("elements");
    let txn = doc.transact();
    let mut keys: Vec<String> = map.keys(&txn).map(str::to_string).collect();
    keys.sort();
    keys
}
