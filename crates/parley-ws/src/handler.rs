use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{FutureExt, SinkExt, StreamExt};
use parley_core::events::{to_payload, ServerEvent};
use parley_core::{e2ee, message, presence, room, AppState, CoreError, ErrorKind};
use parley_models::gateway::*;
use parley_models::user::UserStatus;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Duration, Instant};

use crate::limits::{Gateway, LimitClass};
use crate::session::ConnectionContext;

const WS_PING_INTERVAL: Duration = Duration::from_secs(20);
/// Error kind for rejected-by-rate-limit events; not part of the domain taxonomy.
const RATE_LIMITED: &str = "rate_limited";

async fn send_frame(
    sender: &mut (impl SinkExt<Message> + Unpin),
    frame: &GatewayFrame,
    user_id: Option<i64>,
) -> Result<(), ()> {
    let text = serde_json::to_string(frame).map_err(|err| {
        tracing::error!(event = %frame.event, error = %err, "failed to encode gateway frame");
    })?;
    tracing::trace!(user_id = ?user_id, event = %frame.event, "server_out");
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn send_close(
    sender: &mut (impl SinkExt<Message> + Unpin),
    code: u16,
    reason: &str,
    user_id: Option<i64>,
) -> Result<(), ()> {
    tracing::debug!(user_id = ?user_id, code, reason, "closing gateway connection");
    sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await
        .map_err(|_| ())
}

/// A reply addressed to the requesting connection only.
struct Reply {
    event: &'static str,
    data: Value,
}

impl Reply {
    fn new(event: &'static str, data: Value) -> Self {
        Self { event, data }
    }

    fn success(event: &'static str) -> Self {
        Self::new(event, json!({ "success": true }))
    }
}

fn error_frame(kind: &str, message: String, event: Option<&str>, ack: Option<u64>) -> GatewayFrame {
    let payload = ErrorPayload {
        kind: kind.to_string(),
        message,
        event: event.map(str::to_string),
    };
    GatewayFrame::new(EVENT_ERROR, to_payload(&payload)).with_ack(ack)
}

pub(crate) async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    gateway: Arc<Gateway>,
    token: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();
    let Some(mut guard) = gateway.try_open() else {
        let _ = send_close(&mut sender, 1013, "Gateway is at connection capacity", None).await;
        return;
    };

    let hello = GatewayFrame::new(
        EVENT_HELLO,
        json!({ "heartbeatInterval": gateway.config.heartbeat_interval_ms }),
    );
    if send_frame(&mut sender, &hello, None).await.is_err() {
        return;
    }

    let identify_timeout = Duration::from_millis(gateway.config.identify_timeout_ms);
    let user = match token {
        Some(token) => parley_core::auth::authenticate(&state, &token).await.ok(),
        None => tokio::time::timeout(identify_timeout, wait_for_authenticate(&mut receiver, &state))
            .await
            .ok()
            .flatten(),
    };
    let Some(user) = user else {
        let _ = send_close(
            &mut sender,
            CLOSE_AUTHENTICATION_FAILED,
            "Authentication failed",
            None,
        )
        .await;
        return;
    };

    if !guard.bind_user(user.id) {
        let _ = send_close(
            &mut sender,
            CLOSE_TOO_MANY_CONNECTIONS,
            "Too many concurrent connections for this user",
            Some(user.id),
        )
        .await;
        return;
    }

    let mut ctx = ConnectionContext::new(user.id, user.username.clone());
    // Subscribe before going online so this connection sees its own presence event.
    let event_rx = state.event_bus.subscribe();
    if let Err(err) = presence::connect(&state, ctx.user_id, &ctx.connection_id).await {
        tracing::warn!(user_id = ctx.user_id, error = %err, "failed to record presence");
    }

    let mut profile = user.to_user();
    profile.status = UserStatus::Online;
    let ready = GatewayFrame::new(
        EVENT_READY,
        json!({ "user": to_payload(&profile), "sessionId": &ctx.connection_id }),
    );
    if send_frame(&mut sender, &ready, Some(ctx.user_id)).await.is_ok() {
        tracing::info!(user_id = ctx.user_id, connection_id = %ctx.connection_id, "gateway session ready");
        run_session(&mut sender, &mut receiver, event_rx, &mut ctx, &state, &gateway).await;
    }

    if let Err(err) =
        presence::disconnect(&state, ctx.user_id, &ctx.username, &ctx.connection_id).await
    {
        tracing::warn!(user_id = ctx.user_id, error = %err, "failed to clear presence");
    }
    drop(guard);
}

/// The first frame must be `authenticate`; anything else fails the handshake.
async fn wait_for_authenticate(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    state: &AppState,
) -> Option<parley_db::users::UserRow> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                let frame = serde_json::from_str::<GatewayFrame>(&text).ok()?;
                if frame.event != EVENT_AUTHENTICATE {
                    return None;
                }
                let payload = serde_json::from_value::<AuthenticatePayload>(frame.data).ok()?;
                return parley_core::auth::authenticate(state, &payload.token).await.ok();
            }
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

async fn run_session(
    sender: &mut (impl SinkExt<Message> + Unpin),
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    mut event_rx: tokio::sync::broadcast::Receiver<ServerEvent>,
    ctx: &mut ConnectionContext,
    state: &AppState,
    gateway: &Gateway,
) {
    let heartbeat_timeout = Duration::from_millis(gateway.config.heartbeat_timeout_ms);
    let heartbeat_sleep = tokio::time::sleep(heartbeat_timeout);
    tokio::pin!(heartbeat_sleep);
    let mut ws_ping_interval = tokio::time::interval(WS_PING_INTERVAL);
    ws_ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let shutdown = state.shutdown.clone();
    let shutdown_notified = shutdown.notified();
    tokio::pin!(shutdown_notified);
    shutdown_notified.as_mut().enable();

    let disconnect_reason = loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = match serde_json::from_str::<GatewayFrame>(&text) {
                            Ok(frame) => frame,
                            Err(err) => {
                                let reply = error_frame(
                                    ErrorKind::Validation.as_str(),
                                    format!("malformed frame: {err}"),
                                    None,
                                    None,
                                );
                                if send_frame(sender, &reply, Some(ctx.user_id)).await.is_err() {
                                    break "websocket send error".to_string();
                                }
                                continue;
                            }
                        };
                        if frame.event == EVENT_HEARTBEAT {
                            heartbeat_sleep.as_mut().reset(Instant::now() + heartbeat_timeout);
                            let ack = GatewayFrame::new(EVENT_HEARTBEAT_ACK, Value::Null).with_ack(frame.ack);
                            if send_frame(sender, &ack, Some(ctx.user_id)).await.is_err() {
                                break "websocket send error".to_string();
                            }
                            continue;
                        }
                        if handle_frame(sender, frame, ctx, state, gateway).await.is_err() {
                            break "websocket send error".to_string();
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => format!("client close frame (code={}, reason={})", frame.code, frame.reason),
                            None => "client close frame (no code/reason)".to_string(),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break format!("websocket receive error: {err}"),
                    None => break "websocket stream ended".to_string(),
                }
            }
            event = event_rx.recv() => {
                match event {
                    Ok(event) => {
                        if ctx.wants(&event) {
                            let frame = GatewayFrame::new(event.event_type.clone(), event.payload.clone());
                            if send_frame(sender, &frame, Some(ctx.user_id)).await.is_err() {
                                break "websocket send error".to_string();
                            }
                        }
                        ctx.observe(&event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            user_id = ctx.user_id,
                            skipped,
                            "gateway event stream lagged; forcing reconnect"
                        );
                        let _ = send_close(sender, 1013, "Gateway fell behind; reconnect required", Some(ctx.user_id)).await;
                        break format!("event stream lagged by {skipped} events");
                    }
                    Err(RecvError::Closed) => break "event stream closed".to_string(),
                }
            }
            () = &mut heartbeat_sleep => {
                let _ = send_close(sender, CLOSE_HEARTBEAT_TIMEOUT, "Heartbeat timeout", Some(ctx.user_id)).await;
                tracing::warn!(user_id = ctx.user_id, "heartbeat timeout after {}ms", heartbeat_timeout.as_millis());
                break "heartbeat timeout".to_string();
            }
            () = &mut shutdown_notified => {
                let _ = send_close(sender, 1001, "Server shutting down", Some(ctx.user_id)).await;
                break "server shutdown".to_string();
            }
            _ = ws_ping_interval.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break "websocket ping send error".to_string();
                }
            }
        }
    };
    tracing::info!(user_id = ctx.user_id, connection_id = %ctx.connection_id, "client disconnected: {disconnect_reason}");
}

/// Run one client event and answer the requesting connection. `Err` only on a dead socket.
async fn handle_frame(
    sender: &mut (impl SinkExt<Message> + Unpin),
    frame: GatewayFrame,
    ctx: &mut ConnectionContext,
    state: &AppState,
    gateway: &Gateway,
) -> Result<(), ()> {
    let class = if frame.event == EVENT_TYPING {
        LimitClass::Typing
    } else {
        LimitClass::Message
    };
    if let Err(retry_after_ms) = gateway.check(ctx.user_id, class) {
        if class == LimitClass::Typing {
            tracing::debug!(user_id = ctx.user_id, "rate limited (silent drop)");
            return Ok(());
        }
        let mut reply = error_frame(
            RATE_LIMITED,
            format!("slow down; retry in {retry_after_ms}ms"),
            Some(&frame.event),
            frame.ack,
        );
        reply.data["retryAfterMs"] = json!(retry_after_ms);
        return send_frame(sender, &reply, Some(ctx.user_id)).await;
    }

    let outcome = AssertUnwindSafe(dispatch(state, ctx, &frame))
        .catch_unwind()
        .await;
    let reply = match outcome {
        Ok(Ok(Some(reply))) => GatewayFrame::new(reply.event, reply.data).with_ack(frame.ack),
        Ok(Ok(None)) => {
            if frame.ack.is_none() {
                return Ok(());
            }
            GatewayFrame::new(frame.event.clone(), json!({ "success": true })).with_ack(frame.ack)
        }
        Ok(Err(err)) => {
            if err.kind() == ErrorKind::Transient {
                tracing::error!(user_id = ctx.user_id, event = %frame.event, error = %err, "gateway event failed");
            } else {
                tracing::debug!(user_id = ctx.user_id, event = %frame.event, error = %err, "gateway event rejected");
            }
            error_frame(err.kind().as_str(), err.public_message(), Some(&frame.event), frame.ack)
        }
        Err(_) => {
            tracing::error!(user_id = ctx.user_id, event = %frame.event, "gateway event handler panicked");
            error_frame(
                ErrorKind::Transient.as_str(),
                "internal error".to_string(),
                Some(&frame.event),
                frame.ack,
            )
        }
    };
    send_frame(sender, &reply, Some(ctx.user_id)).await
}

fn decode<T: DeserializeOwned>(frame: &GatewayFrame) -> Result<T, CoreError> {
    serde_json::from_value(frame.data.clone())
        .map_err(|err| CoreError::validation(format!("invalid {} payload: {err}", frame.event)))
}

/// Map a client event onto the domain. `Ok(None)` means the broadcast is the only answer.
async fn dispatch(
    state: &AppState,
    ctx: &mut ConnectionContext,
    frame: &GatewayFrame,
) -> Result<Option<Reply>, CoreError> {
    let user_id = ctx.user_id;
    match frame.event.as_str() {
        EVENT_JOIN_ROOM => {
            let req: RoomRef = decode(frame)?;
            let snapshot = room::join_room(state, user_id, req.room_id).await?;
            ctx.subscribe(req.room_id);
            tracing::debug!(user_id, room_id = req.room_id, "subscribed to room");
            Ok(Some(Reply::new(EVENT_JOIN_ROOM, to_payload(&snapshot))))
        }
        EVENT_LEAVE_ROOM => {
            let req: LeaveRoomPayload = decode(frame)?;
            if req.leave {
                room::leave_room(state, user_id, req.room_id).await?;
            } else {
                presence::clear_typing_in_room(state, req.room_id, user_id, &ctx.username);
            }
            ctx.unsubscribe(req.room_id);
            Ok(Some(Reply::success(EVENT_LEAVE_ROOM)))
        }
        EVENT_JOIN_CHANNEL => {
            let req: JoinChannelPayload = decode(frame)?;
            let channel = room::join_channel(state, user_id, req.room_id, req.channel_id).await?;
            Ok(Some(Reply::new(EVENT_JOIN_CHANNEL, to_payload(&channel))))
        }
        EVENT_MESSAGE => {
            let req: SendMessagePayload = decode(frame)?;
            let outcome =
                message::send_message(state, user_id, &req, Some(&ctx.connection_id)).await?;
            let event = if outcome.scheduled {
                EVENT_MESSAGE_SCHEDULED
            } else {
                EVENT_MESSAGE_SENT
            };
            Ok(Some(Reply::new(
                event,
                json!({ "clientId": req.client_id, "message": to_payload(&outcome.message) }),
            )))
        }
        EVENT_REACTION => {
            let req: ReactionPayload = decode(frame)?;
            message::react(state, user_id, req.message_id, &req.emoji, req.remove).await?;
            Ok(None)
        }
        EVENT_PIN => {
            let req: PinPayload = decode(frame)?;
            message::pin_message(state, user_id, req.room_id, req.message_id).await?;
            Ok(None)
        }
        EVENT_UNPIN => {
            let req: PinPayload = decode(frame)?;
            message::unpin_message(state, user_id, req.room_id, req.message_id).await?;
            Ok(None)
        }
        EVENT_EDIT => {
            let req: EditPayload = decode(frame)?;
            message::edit_message(state, user_id, req.message_id, &req.content).await?;
            Ok(None)
        }
        EVENT_DELETE => {
            let req: DeletePayload = decode(frame)?;
            message::delete_message(state, user_id, req.message_id).await?;
            Ok(None)
        }
        EVENT_TYPING => {
            let req: TypingPayload = decode(frame)?;
            presence::set_typing(
                state,
                user_id,
                &ctx.username,
                req.room_id,
                req.is_typing,
                Some(&ctx.connection_id),
            )?;
            Ok(None)
        }
        EVENT_INVITE_MEMBER => {
            let req: InviteMemberPayload = decode(frame)?;
            let receipt =
                room::invite_member(state, user_id, req.room_id, &req.email, req.role).await?;
            Ok(Some(Reply::new(
                EVENT_INVITE_MEMBER,
                json!({ "success": true, "invite": to_payload(&receipt) }),
            )))
        }
        EVENT_MARK_READ => {
            let req: RoomRef = decode(frame)?;
            let read_at = room::mark_read(state, user_id, req.room_id).await?;
            Ok(Some(Reply::new(
                EVENT_MARK_READ,
                json!({ "success": true, "readAt": read_at }),
            )))
        }
        EVENT_ESTABLISH_SESSION => {
            let req: EstablishSessionPayload = decode(frame)?;
            let bundle = e2ee::establish_direct(state, user_id, req.peer_id).await?;
            Ok(Some(Reply::new(
                EVENT_SESSION_ESTABLISHED,
                json!({ "peerId": req.peer_id.to_string(), "bundle": to_payload(&bundle) }),
            )))
        }
        EVENT_AUTHENTICATE => Err(CoreError::validation("connection is already authenticated")),
        other => Err(CoreError::validation(format!("unknown event `{other}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_frames_carry_kind_and_origin_event() {
        let frame = error_frame("not_found", "room not found".into(), Some(EVENT_JOIN_ROOM), Some(3));
        assert_eq!(frame.event, EVENT_ERROR);
        assert_eq!(frame.ack, Some(3));
        assert_eq!(frame.data["kind"], "not_found");
        assert_eq!(frame.data["event"], EVENT_JOIN_ROOM);
    }

    #[test]
    fn bad_payloads_are_validation_errors() {
        let frame = GatewayFrame::new(EVENT_PIN, json!({ "roomId": "1" }));
        let err = decode::<PinPayload>(&frame).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.public_message().contains("pin"));
    }
}
