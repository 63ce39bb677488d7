use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parley_core::files::LocalFileStore;
use parley_core::mail::LogMailer;
use parley_core::room::{create_room, CreateRoom};
use parley_core::{AppConfig, AppState};
use parley_models::gateway::GatewayFrame;
use parley_models::room::{RoomSettings, RoomType};
use parley_ws::{gateway_router, GatewayConfig};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "gateway-test-secret";
const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    addr: SocketAddr,
    state: AppState,
    _files: tempfile::TempDir,
}

async fn start(config: GatewayConfig) -> Harness {
    let pool = parley_db::create_pool("sqlite::memory:", 1).await.unwrap();
    parley_db::run_migrations(&pool).await.unwrap();
    let files = tempfile::tempdir().unwrap();
    let state = AppState::new(
        pool,
        AppConfig {
            jwt_secret: SECRET.into(),
            ..AppConfig::default()
        },
        Arc::new(LogMailer),
        Arc::new(LocalFileStore::new(files.path(), "/files")),
    );
    let app: Router = gateway_router(config).with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Harness {
        addr,
        state,
        _files: files,
    }
}

async fn user(state: &AppState, id: i64, name: &str) -> String {
    parley_db::users::create_user(
        &state.db,
        id,
        name,
        &format!("{name}@example.com"),
        "hash",
        Utc::now(),
    )
    .await
    .unwrap();
    parley_core::auth::issue_token(id, SECRET, 3600).unwrap()
}

async fn public_room(state: &AppState, owner: i64) -> i64 {
    create_room(
        state,
        owner,
        &CreateRoom {
            name: "lobby",
            description: None,
            room_type: RoomType::Public,
            settings: RoomSettings::default(),
        },
    )
    .await
    .unwrap()
    .id
}

async fn open(addr: SocketAddr, token: Option<&str>) -> Client {
    let url = match token {
        Some(token) => format!("ws://{addr}/gateway?token={token}"),
        None => format!("ws://{addr}/gateway"),
    };
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

/// Connect with a query token and consume `hello` and `ready`.
async fn login(addr: SocketAddr, token: &str) -> Client {
    let mut ws = open(addr, Some(token)).await;
    assert_eq!(next_frame(&mut ws).await.event, "hello");
    assert_eq!(next_frame(&mut ws).await.event, "ready");
    ws
}

async fn send(ws: &mut Client, event: &str, data: Value, ack: Option<u64>) {
    let frame = GatewayFrame::new(event, data).with_ack(ack);
    ws.send(Message::text(serde_json::to_string(&frame).unwrap()))
        .await
        .unwrap();
}

async fn next_message(ws: &mut Client) -> Message {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for gateway")
            .expect("stream ended")
            .expect("websocket error");
        if !matches!(msg, Message::Ping(_) | Message::Pong(_)) {
            return msg;
        }
    }
}

async fn next_frame(ws: &mut Client) -> GatewayFrame {
    match next_message(ws).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

/// Skip frames until `event` arrives; returns it together with everything skipped.
async fn wait_for(ws: &mut Client, event: &str) -> (GatewayFrame, Vec<String>) {
    let mut skipped = Vec::new();
    loop {
        let frame = next_frame(ws).await;
        if frame.event == event {
            return (frame, skipped);
        }
        skipped.push(frame.event);
    }
}

async fn expect_close(ws: &mut Client) -> u16 {
    match next_message(ws).await {
        Message::Close(Some(frame)) => u16::from(frame.code),
        other => panic!("expected a close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn bad_query_token_is_rejected_before_any_event() {
    let harness = start(GatewayConfig::default()).await;
    let mut ws = open(harness.addr, Some("not-a-token")).await;
    assert_eq!(next_frame(&mut ws).await.event, "hello");
    assert_eq!(expect_close(&mut ws).await, 4001);
}

#[tokio::test]
async fn authenticate_frame_completes_the_handshake() {
    let harness = start(GatewayConfig::default()).await;
    let token = user(&harness.state, 1, "alice").await;

    let mut ws = open(harness.addr, None).await;
    let hello = next_frame(&mut ws).await;
    assert_eq!(hello.data["heartbeatInterval"], 41_250);
    send(&mut ws, "authenticate", json!({ "token": token }), None).await;

    let ready = next_frame(&mut ws).await;
    assert_eq!(ready.event, "ready");
    assert_eq!(ready.data["user"]["id"], "1");
    assert_eq!(ready.data["user"]["status"], "online");
    assert!(harness.state.presence.is_online(1));
}

#[tokio::test]
async fn any_other_first_frame_fails_authentication() {
    let harness = start(GatewayConfig::default()).await;
    let mut ws = open(harness.addr, None).await;
    next_frame(&mut ws).await;
    send(&mut ws, "joinRoom", json!({ "roomId": "1" }), None).await;
    assert_eq!(expect_close(&mut ws).await, 4001);
}

#[tokio::test]
async fn messages_reach_the_room_and_the_sender_gets_an_ack() {
    let harness = start(GatewayConfig::default()).await;
    let alice_token = user(&harness.state, 1, "alice").await;
    let bob_token = user(&harness.state, 2, "bob").await;
    let room_id = public_room(&harness.state, 1).await;

    let mut alice = login(harness.addr, &alice_token).await;
    let mut bob = login(harness.addr, &bob_token).await;

    send(&mut alice, "joinRoom", json!({ "roomId": room_id.to_string() }), Some(1)).await;
    let (snapshot, _) = wait_for(&mut alice, "joinRoom").await;
    assert_eq!(snapshot.ack, Some(1));
    assert_eq!(snapshot.data["room"]["id"], room_id.to_string());

    send(&mut bob, "joinRoom", json!({ "roomId": room_id.to_string() }), None).await;
    let (snapshot, _) = wait_for(&mut bob, "joinRoom").await;
    assert_eq!(snapshot.data["members"].as_array().unwrap().len(), 2);
    wait_for(&mut alice, "member:joined").await;

    send(
        &mut alice,
        "message",
        json!({ "roomId": room_id.to_string(), "content": "hello", "clientId": "tmp-1" }),
        Some(2),
    )
    .await;
    let (sent, skipped) = wait_for(&mut alice, "message:sent").await;
    assert_eq!(sent.ack, Some(2));
    assert_eq!(sent.data["clientId"], "tmp-1");
    assert_eq!(sent.data["message"]["content"], "hello");
    assert!(!skipped.iter().any(|event| event == "message:new"));

    let (new, _) = wait_for(&mut bob, "message:new").await;
    assert_eq!(new.data["id"], sent.data["message"]["id"]);

    // The sender's own copy never comes back as a broadcast.
    send(&mut alice, "heartbeat", Value::Null, None).await;
    let (_, skipped) = wait_for(&mut alice, "heartbeat:ack").await;
    assert!(!skipped.iter().any(|event| event == "message:new"));
}

#[tokio::test]
async fn domain_errors_are_scoped_to_the_requesting_connection() {
    let harness = start(GatewayConfig::default()).await;
    let alice_token = user(&harness.state, 1, "alice").await;
    let bob_token = user(&harness.state, 2, "bob").await;
    let private_room = create_room(
        &harness.state,
        1,
        &CreateRoom {
            name: "staff",
            description: None,
            room_type: RoomType::Private,
            settings: RoomSettings::default(),
        },
    )
    .await
    .unwrap()
    .id;

    let mut alice = login(harness.addr, &alice_token).await;
    send(&mut alice, "joinRoom", json!({ "roomId": private_room.to_string() }), None).await;
    wait_for(&mut alice, "joinRoom").await;

    let mut bob = login(harness.addr, &bob_token).await;
    send(&mut bob, "joinRoom", json!({ "roomId": private_room.to_string() }), Some(9)).await;
    let (error, _) = wait_for(&mut bob, "error").await;
    assert_eq!(error.ack, Some(9));
    assert_eq!(error.data["kind"], "authorization");
    assert_eq!(error.data["event"], "joinRoom");

    send(&mut bob, "reaction", json!({ "messageId": "12345", "emoji": "👍" }), None).await;
    let (error, _) = wait_for(&mut bob, "error").await;
    assert_eq!(error.data["kind"], "not_found");

    send(&mut bob, "teleport", json!({}), None).await;
    let (error, _) = wait_for(&mut bob, "error").await;
    assert_eq!(error.data["kind"], "validation");

    // The connection survives every rejection.
    send(&mut bob, "heartbeat", Value::Null, None).await;
    wait_for(&mut bob, "heartbeat:ack").await;

    // Nothing leaked to the room.
    send(&mut alice, "heartbeat", Value::Null, None).await;
    let (_, skipped) = wait_for(&mut alice, "heartbeat:ack").await;
    assert!(!skipped.iter().any(|event| event == "error" || event == "member:joined"));
}

/// Alice owns a public room; both connections have subscribed to it.
async fn shared_room(harness: &Harness) -> (Client, Client, String) {
    let alice_token = user(&harness.state, 1, "alice").await;
    let bob_token = user(&harness.state, 2, "bob").await;
    let room_id = public_room(&harness.state, 1).await.to_string();

    let mut alice = login(harness.addr, &alice_token).await;
    let mut bob = login(harness.addr, &bob_token).await;
    for ws in [&mut alice, &mut bob] {
        send(ws, "joinRoom", json!({ "roomId": room_id }), None).await;
        wait_for(ws, "joinRoom").await;
    }
    (alice, bob, room_id)
}

async fn post(ws: &mut Client, room_id: &str, content: &str, ack: u64) -> String {
    send(ws, "message", json!({ "roomId": room_id, "content": content }), Some(ack)).await;
    let (sent, _) = wait_for(ws, "message:sent").await;
    sent.data["message"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn reactions_and_pins_are_acked_and_broadcast() {
    let harness = start(GatewayConfig::default()).await;
    let (mut alice, mut bob, room_id) = shared_room(&harness).await;
    let message_id = post(&mut bob, &room_id, "ship it", 1).await;
    wait_for(&mut alice, "message:new").await;

    send(&mut alice, "reaction", json!({ "messageId": message_id, "emoji": "🚀" }), Some(2)).await;
    let (ack, _) = wait_for(&mut alice, "reaction").await;
    assert_eq!(ack.ack, Some(2));
    assert_eq!(ack.data["success"], true);
    let (reaction, _) = wait_for(&mut bob, "message:reaction").await;
    assert_eq!(reaction.data["messageId"], message_id.as_str());
    assert_eq!(reaction.data["emoji"], "🚀");
    assert_eq!(reaction.data["userId"], "1");
    assert_eq!(reaction.data["reactions"].as_array().unwrap().len(), 1);

    send(&mut alice, "pin", json!({ "roomId": room_id, "messageId": message_id }), Some(3)).await;
    let (ack, _) = wait_for(&mut alice, "pin").await;
    assert_eq!(ack.ack, Some(3));
    assert_eq!(ack.data["success"], true);
    let (pinned, _) = wait_for(&mut bob, "messagePinned").await;
    assert_eq!(pinned.data["messageId"], message_id.as_str());
    assert_eq!(pinned.data["pinnedBy"], "1");
    assert_eq!(pinned.data["message"]["isPinned"], true);

    send(&mut alice, "unpin", json!({ "roomId": room_id, "messageId": message_id }), Some(4)).await;
    let (ack, _) = wait_for(&mut alice, "unpin").await;
    assert_eq!(ack.ack, Some(4));
    assert_eq!(ack.data["success"], true);
    let (unpinned, _) = wait_for(&mut bob, "messageUnpinned").await;
    assert_eq!(unpinned.data["messageId"], message_id.as_str());
    assert_eq!(unpinned.data["roomId"], room_id.as_str());

    // Members cannot pin.
    send(&mut bob, "pin", json!({ "roomId": room_id, "messageId": message_id }), Some(5)).await;
    let (error, _) = wait_for(&mut bob, "error").await;
    assert_eq!(error.ack, Some(5));
    assert_eq!(error.data["kind"], "authorization");
}

#[tokio::test]
async fn edits_and_deletes_are_acked_and_broadcast() {
    let harness = start(GatewayConfig::default()).await;
    let (mut alice, mut bob, room_id) = shared_room(&harness).await;
    let message_id = post(&mut bob, &room_id, "frist", 1).await;
    wait_for(&mut alice, "message:new").await;

    send(&mut bob, "edit", json!({ "messageId": message_id, "content": "first" }), Some(2)).await;
    let (ack, _) = wait_for(&mut bob, "edit").await;
    assert_eq!(ack.ack, Some(2));
    assert_eq!(ack.data["success"], true);
    let (edited, _) = wait_for(&mut alice, "messageEdited").await;
    assert_eq!(edited.data["id"], message_id.as_str());
    assert_eq!(edited.data["content"], "first");
    assert_eq!(edited.data["isEdited"], true);

    // Only the sender may edit.
    send(&mut alice, "edit", json!({ "messageId": message_id, "content": "mine" }), Some(3)).await;
    let (error, _) = wait_for(&mut alice, "error").await;
    assert_eq!(error.data["kind"], "authorization");
    assert_eq!(error.data["event"], "edit");

    send(&mut bob, "delete", json!({ "messageId": message_id }), Some(4)).await;
    let (ack, _) = wait_for(&mut bob, "delete").await;
    assert_eq!(ack.ack, Some(4));
    assert_eq!(ack.data["success"], true);
    let (deleted, _) = wait_for(&mut alice, "messageDeleted").await;
    assert_eq!(deleted.data["messageId"], message_id.as_str());
    assert_eq!(deleted.data["roomId"], room_id.as_str());
    assert!(deleted.data["deletedAt"].is_string());
}

#[tokio::test]
async fn scheduled_messages_are_acked_but_not_broadcast() {
    let harness = start(GatewayConfig::default()).await;
    let (mut alice, mut bob, room_id) = shared_room(&harness).await;

    let at = Utc::now() + chrono::Duration::hours(1);
    send(
        &mut alice,
        "message",
        json!({ "roomId": room_id, "content": "later", "scheduledFor": at, "clientId": "tmp-9" }),
        Some(7),
    )
    .await;
    let (scheduled, skipped) = wait_for(&mut alice, "message:scheduled").await;
    assert_eq!(scheduled.ack, Some(7));
    assert_eq!(scheduled.data["clientId"], "tmp-9");
    assert_eq!(scheduled.data["message"]["isScheduled"], true);
    assert!(!skipped.iter().any(|event| event == "message:sent"));

    send(&mut bob, "heartbeat", Value::Null, None).await;
    let (_, skipped) = wait_for(&mut bob, "heartbeat:ack").await;
    assert!(!skipped.iter().any(|event| event == "message:new"));
}

#[tokio::test]
async fn typing_reaches_others_and_disconnect_goes_offline() {
    let harness = start(GatewayConfig::default()).await;
    let alice_token = user(&harness.state, 1, "alice").await;
    let bob_token = user(&harness.state, 2, "bob").await;
    let room_id = public_room(&harness.state, 1).await;

    let mut alice = login(harness.addr, &alice_token).await;
    let mut bob = login(harness.addr, &bob_token).await;
    for ws in [&mut alice, &mut bob] {
        send(ws, "joinRoom", json!({ "roomId": room_id.to_string() }), None).await;
        wait_for(ws, "joinRoom").await;
    }

    send(&mut bob, "typing", json!({ "roomId": room_id.to_string(), "isTyping": true }), None).await;
    let (typing, _) = wait_for(&mut alice, "typing").await;
    assert_eq!(typing.data["userId"], "2");
    assert_eq!(typing.data["isTyping"], true);
    assert_eq!(typing.data["typingUsers"][0]["username"], "bob");

    bob.close(None).await.unwrap();
    let (cleared, _) = wait_for(&mut alice, "typing").await;
    assert_eq!(cleared.data["isTyping"], false);
    assert!(cleared.data["typingUsers"].as_array().unwrap().is_empty());

    let (presence, _) = wait_for(&mut alice, "presence").await;
    assert_eq!(presence.data["userId"], "2");
    assert_eq!(presence.data["status"], "offline");
    assert!(!harness.state.presence.is_online(2));
}

#[tokio::test]
async fn message_budget_is_enforced_per_user() {
    let harness = start(GatewayConfig {
        messages_per_minute: 2,
        ..GatewayConfig::default()
    })
    .await;
    let token = user(&harness.state, 1, "alice").await;
    let room_id = public_room(&harness.state, 1).await;
    let mut ws = login(harness.addr, &token).await;

    for ack in 1..=2 {
        send(&mut ws, "markRead", json!({ "roomId": room_id.to_string() }), Some(ack)).await;
        let (reply, _) = wait_for(&mut ws, "markRead").await;
        assert_eq!(reply.data["success"], true);
    }
    send(&mut ws, "markRead", json!({ "roomId": room_id.to_string() }), Some(3)).await;
    let (error, _) = wait_for(&mut ws, "error").await;
    assert_eq!(error.data["kind"], "rate_limited");
    assert_eq!(error.ack, Some(3));
}

#[tokio::test]
async fn per_user_connection_cap_closes_extra_connections() {
    let harness = start(GatewayConfig {
        max_connections_per_user: 1,
        ..GatewayConfig::default()
    })
    .await;
    let token = user(&harness.state, 1, "alice").await;
    let _first = login(harness.addr, &token).await;

    let mut second = open(harness.addr, Some(&token)).await;
    assert_eq!(next_frame(&mut second).await.event, "hello");
    assert_eq!(expect_close(&mut second).await, 4008);
}
