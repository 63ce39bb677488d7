use chrono::{DateTime, Duration, Utc};
use parley_db::messages::{HistoryCursor, MessageRow, NewMessage, RoomScope};
use parley_db::rooms::RoomRow;
use parley_models::gateway::{
    SendMessagePayload, EVENT_MESSAGE_DELETED, EVENT_MESSAGE_EDITED, EVENT_MESSAGE_NEW,
    EVENT_MESSAGE_PINNED, EVENT_MESSAGE_REACTION, EVENT_MESSAGE_UNPINNED,
};
use parley_models::message::{Message, MessageEdit, MessageKind, MessageMetadata, MessageTarget};
use parley_models::room::{MemberRole, RoomSettings};
use parley_util::pagination::{CursorParams, CursorResponse};
use parley_util::validation::{validate_emoji, validate_message_content, MAX_MESSAGE_LEN};
use serde_json::json;

use crate::events::{to_payload, Audience};
use crate::permissions::{load_room, require_member, require_role};
use crate::{AppState, CoreError};

/// Longest self-destruct timer a sender may set.
pub const MAX_EXPIRATION_MINUTES: i64 = 30 * 24 * 60;
const MAX_CLIENT_ID_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    /// Held back for the scheduler instead of broadcast.
    pub scheduled: bool,
}

/// Who receives events about `message`.
pub fn audience_for(message: &Message) -> Option<Audience> {
    match message.target()? {
        MessageTarget::Room { room_id, .. } => Some(Audience::Room(room_id)),
        MessageTarget::Direct { recipient_id } => {
            Some(Audience::Users(vec![message.sender_id, recipient_id]))
        }
    }
}

pub(crate) fn publish(state: &AppState, event: &str, message: &Message, payload: serde_json::Value, origin: Option<&str>) {
    match audience_for(message) {
        Some(audience) => state.event_bus.dispatch_except(event, payload, audience, origin),
        None => tracing::warn!(message_id = message.id, event, "message has no delivery target"),
    }
}

/// Broadcast a message that just became visible.
pub fn broadcast_new(state: &AppState, message: &Message, origin: Option<&str>) {
    publish(state, EVENT_MESSAGE_NEW, message, to_payload(message), origin);
}

/// Attach reactions to rows with one query.
pub async fn hydrate(state: &AppState, rows: Vec<MessageRow>) -> Result<Vec<Message>, CoreError> {
    let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
    let mut reactions = parley_db::reactions::list_reactions_for(&state.db, &ids).await?;
    Ok(rows
        .iter()
        .map(|row| row.to_message(reactions.remove(&row.id).unwrap_or_default()))
        .collect())
}

async fn hydrate_one(state: &AppState, row: &MessageRow) -> Result<Message, CoreError> {
    let reactions = parley_db::reactions::list_reactions(&state.db, row.id).await?;
    Ok(row.to_message(reactions))
}

fn resolve_target(req: &SendMessagePayload) -> Result<MessageTarget, CoreError> {
    match (req.room_id, req.recipient_id) {
        (Some(room_id), None) => Ok(MessageTarget::Room {
            room_id,
            channel_id: req.channel_id,
        }),
        (None, Some(recipient_id)) if req.channel_id.is_none() => {
            Ok(MessageTarget::Direct { recipient_id })
        }
        (None, Some(_)) => Err(CoreError::validation("direct messages cannot target a channel")),
        _ => Err(CoreError::validation("exactly one of roomId or recipientId is required")),
    }
}

/// Type-specific shape rules for a new message.
pub fn check_content(kind: MessageKind, content: &str, metadata: &MessageMetadata) -> Result<(), CoreError> {
    if kind == MessageKind::Text {
        validate_message_content(content)?;
        return Ok(());
    }
    if content.chars().count() > MAX_MESSAGE_LEN {
        return Err(CoreError::validation(format!(
            "caption must be at most {MAX_MESSAGE_LEN} characters"
        )));
    }
    let has_url = metadata
        .file_url
        .as_deref()
        .is_some_and(|url| !url.trim().is_empty());
    match kind {
        MessageKind::Voice => {
            if !metadata.duration.is_some_and(|d| d.is_finite() && d > 0.0) {
                return Err(CoreError::validation("voice messages need a positive duration"));
            }
        }
        _ if !has_url => {
            return Err(CoreError::validation(format!(
                "{} messages need a file URL",
                kind.as_str()
            )));
        }
        _ => {}
    }
    if metadata.file_size.is_some_and(|size| size < 0) {
        return Err(CoreError::validation("file size cannot be negative"));
    }
    Ok(())
}

/// Whether the room's settings permit this message type.
pub fn kind_allowed(settings: &RoomSettings, kind: MessageKind) -> Result<(), CoreError> {
    let allowed = match kind {
        MessageKind::Text => true,
        MessageKind::Voice => settings.allow_voice,
        MessageKind::Gif => settings.allow_gifs,
        MessageKind::File | MessageKind::Image | MessageKind::Audio | MessageKind::Video => {
            settings.allow_files
        }
    };
    if !allowed {
        return Err(CoreError::validation(format!(
            "{} messages are disabled in this room",
            kind.as_str()
        )));
    }
    Ok(())
}

/// Persist a message and broadcast it, or hold it for the scheduler.
///
/// `origin` is the sending connection; it gets `message:sent` from the
/// gateway rather than its own `message:new`.
pub async fn send_message(
    state: &AppState,
    sender_id: i64,
    req: &SendMessagePayload,
    origin: Option<&str>,
) -> Result<SendOutcome, CoreError> {
    let now = Utc::now();
    let target = resolve_target(req)?;
    let kind = req.kind.unwrap_or(MessageKind::Text);
    let metadata = req.metadata.clone().unwrap_or_default();
    let content = req.content.as_deref().unwrap_or("");
    check_content(kind, content, &metadata)?;

    if req.client_id.as_deref().is_some_and(|id| id.len() > MAX_CLIENT_ID_LEN) {
        return Err(CoreError::validation("clientId too long"));
    }
    if let Some(at) = req.scheduled_for {
        if at <= now {
            return Err(CoreError::validation("scheduledFor must be in the future"));
        }
    }
    let expires_at = match req.expiration_minutes {
        None => None,
        Some(minutes) if minutes <= 0 => {
            return Err(CoreError::validation("expirationMinutes must be positive"))
        }
        Some(minutes) if minutes > MAX_EXPIRATION_MINUTES => {
            return Err(CoreError::validation("expirationMinutes too large"))
        }
        Some(minutes) => Some(req.scheduled_for.unwrap_or(now) + Duration::minutes(minutes)),
    };

    let mut slow_mode_key = None;
    match target {
        MessageTarget::Room { room_id, channel_id } => {
            let room = load_room(&state.db, room_id).await?;
            let member = require_member(&state.db, room_id, sender_id).await?;
            let settings = room.settings();
            kind_allowed(&settings, kind)?;
            if req.reply_to.is_some() && !settings.allow_replies {
                return Err(CoreError::validation("replies are disabled in this room"));
            }
            if let Some(channel_id) = channel_id {
                parley_db::channels::get_channel(&state.db, channel_id)
                    .await?
                    .filter(|c| c.room_id == room_id)
                    .ok_or(CoreError::NotFound("channel"))?;
                if !parley_db::channels::is_channel_member(&state.db, channel_id, sender_id).await? {
                    return Err(CoreError::forbidden("join the channel before posting"));
                }
            }
            if settings.slow_mode_seconds > 0 && !member.role().is_moderator() {
                let key = (room_id, sender_id);
                if let Some(last) = state.slow_mode.get(&key).await {
                    let wait = last + Duration::seconds(settings.slow_mode_seconds) - now;
                    if wait > Duration::zero() {
                        return Err(CoreError::validation(format!(
                            "slow mode is on, wait {}s",
                            wait.num_seconds().max(1)
                        )));
                    }
                }
                slow_mode_key = Some(key);
            }
        }
        MessageTarget::Direct { recipient_id } => {
            if recipient_id == sender_id {
                return Err(CoreError::validation("cannot send a direct message to yourself"));
            }
            parley_db::users::get_user(&state.db, recipient_id)
                .await?
                .ok_or(CoreError::NotFound("user"))?;
        }
    }
    if let Some(reply_to) = req.reply_to {
        check_reply(state, reply_to, sender_id, target, now).await?;
    }

    let row = parley_db::messages::create_message(
        &state.db,
        &NewMessage {
            id: state.next_id(),
            target,
            sender_id,
            content,
            kind,
            metadata: &metadata,
            reply_to: req.reply_to,
            scheduled_for: req.scheduled_for,
            expires_at,
            client_id: req.client_id.as_deref(),
        },
        now,
    )
    .await?;
    if let Some(key) = slow_mode_key {
        state.slow_mode.insert(key, now).await;
    }
    let message = row.to_message(Vec::new());

    if message.is_scheduled {
        tracing::info!(message_id = message.id, sender_id, scheduled_for = ?message.scheduled_for, "message scheduled");
        return Ok(SendOutcome { message, scheduled: true });
    }
    broadcast_new(state, &message, origin);
    tracing::debug!(message_id = message.id, sender_id, "message sent");
    Ok(SendOutcome { message, scheduled: false })
}

/// A reply must point at a visible message in the same conversation.
async fn check_reply(
    state: &AppState,
    reply_to: i64,
    sender_id: i64,
    target: MessageTarget,
    now: DateTime<Utc>,
) -> Result<(), CoreError> {
    let parent = visible_row(state, sender_id, reply_to, now).await?;
    let same_conversation = match (target, parent.target()) {
        (MessageTarget::Room { room_id, .. }, Some(MessageTarget::Room { room_id: parent_room, .. })) => {
            room_id == parent_room
        }
        (MessageTarget::Direct { recipient_id }, Some(MessageTarget::Direct { recipient_id: parent_recipient })) => {
            let mut pair = [sender_id, recipient_id];
            let mut parent_pair = [parent.sender_id, parent_recipient];
            pair.sort_unstable();
            parent_pair.sort_unstable();
            pair == parent_pair
        }
        _ => false,
    };
    if !same_conversation {
        return Err(CoreError::validation("reply target belongs to another conversation"));
    }
    Ok(())
}

/// Load a message the viewer is allowed to see. Hidden messages look missing.
async fn visible_row(
    state: &AppState,
    viewer_id: i64,
    message_id: i64,
    now: DateTime<Utc>,
) -> Result<MessageRow, CoreError> {
    let row = parley_db::messages::get_message(&state.db, message_id)
        .await?
        .ok_or(CoreError::NotFound("message"))?;
    if row.expires_at.is_some_and(|at| at <= now) {
        return Err(CoreError::NotFound("message"));
    }
    if row.is_scheduled && row.sender_id != viewer_id {
        return Err(CoreError::NotFound("message"));
    }
    match row.target() {
        Some(MessageTarget::Room { room_id, .. }) => {
            require_member(&state.db, room_id, viewer_id).await?;
        }
        Some(MessageTarget::Direct { recipient_id }) => {
            if viewer_id != row.sender_id && viewer_id != recipient_id {
                return Err(CoreError::NotFound("message"));
            }
        }
        None => return Err(CoreError::NotFound("message")),
    }
    Ok(row)
}

/// Add or remove one reaction and broadcast the message's full reaction list.
pub async fn react(
    state: &AppState,
    user_id: i64,
    message_id: i64,
    emoji: &str,
    remove: bool,
) -> Result<Message, CoreError> {
    let emoji = emoji.trim();
    validate_emoji(emoji)?;
    let now = Utc::now();
    let row = visible_row(state, user_id, message_id, now).await?;
    if row.is_deleted {
        return Err(CoreError::validation("cannot react to a deleted message"));
    }
    if row.is_scheduled {
        return Err(CoreError::validation("cannot react to a scheduled message"));
    }
    if let Some(room_id) = row.room_id {
        if !load_room(&state.db, room_id).await?.settings().allow_reactions {
            return Err(CoreError::validation("reactions are disabled in this room"));
        }
    }

    if remove {
        if !parley_db::reactions::remove_reaction(&state.db, message_id, user_id, emoji).await? {
            return Err(CoreError::validation("no such reaction to remove"));
        }
    } else if !parley_db::reactions::add_reaction(&state.db, message_id, user_id, emoji, now).await? {
        return Err(CoreError::validation("already reacted with that emoji"));
    }

    let message = hydrate_one(state, &row).await?;
    publish(
        state,
        EVENT_MESSAGE_REACTION,
        &message,
        json!({
            "messageId": message.id.to_string(),
            "roomId": message.room_id.map(|id| id.to_string()),
            "userId": user_id.to_string(),
            "emoji": emoji,
            "removed": remove,
            "reactions": to_payload(&message.reactions),
        }),
        None,
    );
    Ok(message)
}

/// Load a message that must live in `room_id` for a moderator action.
async fn room_message(state: &AppState, actor_id: i64, room_id: i64, message_id: i64) -> Result<(RoomRow, MessageRow), CoreError> {
    let room = load_room(&state.db, room_id).await?;
    let actor = require_member(&state.db, room_id, actor_id).await?;
    require_role(&actor, MemberRole::Admin, "manage pins")?;
    let row = parley_db::messages::get_message(&state.db, message_id)
        .await?
        .filter(|row| row.room_id == Some(room_id))
        .ok_or(CoreError::NotFound("message"))?;
    Ok((room, row))
}

/// Pin a message: flag the message, then add it to the room's pin list.
///
/// If the second step fails the flag is rolled back and the error returned.
/// The two writes are not atomic; a failed rollback is logged.
pub async fn pin_message(state: &AppState, actor_id: i64, room_id: i64, message_id: i64) -> Result<Message, CoreError> {
    let (room, row) = room_message(state, actor_id, room_id, message_id).await?;
    if !room.settings().allow_pins {
        return Err(CoreError::validation("pinning is disabled in this room"));
    }
    if row.is_deleted {
        return Err(CoreError::validation("cannot pin a deleted message"));
    }
    if row.is_scheduled {
        return Err(CoreError::validation("cannot pin a scheduled message"));
    }
    let now = Utc::now();
    let pinned = parley_db::messages::mark_pinned(&state.db, message_id, actor_id, now)
        .await?
        .ok_or_else(|| CoreError::conflict("message is already pinned"))?;

    if let Err(err) = parley_db::pins::add_room_pin(&state.db, room_id, message_id, actor_id, now).await {
        match parley_db::messages::restore_pin_state(&state.db, message_id, None, None).await {
            Ok(()) => tracing::error!(room_id, message_id, error = %err, "failed to record room pin, message flag rolled back"),
            Err(rollback) => tracing::error!(
                room_id,
                message_id,
                error = %err,
                rollback_error = %rollback,
                "failed to record room pin and to roll back the message flag"
            ),
        }
        return Err(err.into());
    }

    let message = hydrate_one(state, &pinned).await?;
    state.event_bus.dispatch(
        EVENT_MESSAGE_PINNED,
        json!({
            "roomId": room_id.to_string(),
            "messageId": message_id.to_string(),
            "pinnedBy": actor_id.to_string(),
            "pinnedAt": now,
            "message": to_payload(&message),
        }),
        room_id,
    );
    tracing::info!(room_id, message_id, actor_id, "message pinned");
    Ok(message)
}

pub async fn unpin_message(state: &AppState, actor_id: i64, room_id: i64, message_id: i64) -> Result<Message, CoreError> {
    // Unpinning stays possible after pins are disabled or the message is deleted.
    let (_, before) = room_message(state, actor_id, room_id, message_id).await?;
    let unpinned = parley_db::messages::mark_unpinned(&state.db, message_id)
        .await?
        .ok_or_else(|| CoreError::conflict("message is not pinned"))?;

    if let Err(err) = parley_db::pins::remove_room_pin(&state.db, room_id, message_id).await {
        match parley_db::messages::restore_pin_state(&state.db, message_id, before.pinned_by, before.pinned_at).await {
            Ok(()) => tracing::error!(room_id, message_id, error = %err, "failed to remove room pin, message flag restored"),
            Err(rollback) => tracing::error!(
                room_id,
                message_id,
                error = %err,
                rollback_error = %rollback,
                "failed to remove room pin and to restore the message flag"
            ),
        }
        return Err(err.into());
    }

    let message = hydrate_one(state, &unpinned).await?;
    state.event_bus.dispatch(
        EVENT_MESSAGE_UNPINNED,
        json!({ "roomId": room_id.to_string(), "messageId": message_id.to_string() }),
        room_id,
    );
    tracing::info!(room_id, message_id, actor_id, "message unpinned");
    Ok(message)
}

/// Replace a message's text. Only the sender may edit; the old text goes to the history.
pub async fn edit_message(state: &AppState, user_id: i64, message_id: i64, content: &str) -> Result<Message, CoreError> {
    validate_message_content(content)?;
    let now = Utc::now();
    let row = visible_row(state, user_id, message_id, now).await?;
    if row.sender_id != user_id {
        return Err(CoreError::forbidden("only the sender can edit a message"));
    }
    if row.is_deleted {
        return Err(CoreError::validation("cannot edit a deleted message"));
    }
    let updated = parley_db::messages::edit_message(&state.db, message_id, state.next_id(), content, now)
        .await?
        .ok_or(CoreError::NotFound("message"))?;
    let message = hydrate_one(state, &updated).await?;
    if !message.is_scheduled {
        publish(state, EVENT_MESSAGE_EDITED, &message, to_payload(&message), None);
    }
    Ok(message)
}

/// Soft-delete: the row stays so replies still resolve, the content does not.
pub async fn delete_message(state: &AppState, user_id: i64, message_id: i64) -> Result<Message, CoreError> {
    let now = Utc::now();
    let row = visible_row(state, user_id, message_id, now).await?;
    if row.sender_id != user_id {
        return Err(CoreError::forbidden("only the sender can delete a message"));
    }
    let deleted = parley_db::messages::soft_delete_message(&state.db, message_id, now)
        .await?
        .ok_or_else(|| CoreError::conflict("message already deleted"))?;
    let message = hydrate_one(state, &deleted).await?;
    if !message.is_scheduled {
        publish(
            state,
            EVENT_MESSAGE_DELETED,
            &message,
            json!({
                "messageId": message_id.to_string(),
                "roomId": message.room_id.map(|id| id.to_string()),
                "deletedAt": message.deleted_at,
            }),
            None,
        );
    }
    Ok(message)
}

pub async fn edit_history(state: &AppState, viewer_id: i64, message_id: i64) -> Result<Vec<MessageEdit>, CoreError> {
    let row = visible_row(state, viewer_id, message_id, Utc::now()).await?;
    if row.is_deleted {
        return Err(CoreError::NotFound("message"));
    }
    Ok(parley_db::messages::list_edits(&state.db, message_id).await?)
}

fn page(mut messages: Vec<Message>, limit: usize) -> CursorResponse<Message> {
    let has_more = messages.len() > limit;
    messages.truncate(limit);
    let next_before = if has_more {
        messages.last().map(|m| m.id)
    } else {
        None
    };
    CursorResponse {
        items: messages,
        has_more,
        next_before,
    }
}

/// Turn a `before` message id into a history position.
async fn resolve_cursor(state: &AppState, before: Option<i64>) -> Result<Option<HistoryCursor>, CoreError> {
    let Some(id) = before else {
        return Ok(None);
    };
    if let Some(cursor) = parley_db::messages::history_cursor(&state.db, id).await? {
        return Ok(Some(cursor));
    }
    // The row has expired since; its snowflake still says when it was made.
    let millis = i64::try_from(parley_util::snowflake::timestamp_millis(id))
        .map_err(|_| CoreError::validation("invalid cursor"))?;
    let created_at = DateTime::from_timestamp_millis(millis).ok_or_else(|| CoreError::validation("invalid cursor"))?;
    Ok(Some(HistoryCursor { created_at, id }))
}

/// Room history, newest first, paged by `before`.
pub async fn room_history(
    state: &AppState,
    viewer_id: i64,
    room_id: i64,
    channel_id: Option<i64>,
    cursor: &CursorParams,
) -> Result<CursorResponse<Message>, CoreError> {
    load_room(&state.db, room_id).await?;
    require_member(&state.db, room_id, viewer_id).await?;
    let scope = match channel_id {
        Some(channel_id) => {
            parley_db::channels::get_channel(&state.db, channel_id)
                .await?
                .filter(|c| c.room_id == room_id)
                .ok_or(CoreError::NotFound("channel"))?;
            RoomScope::Channel(channel_id)
        }
        None => RoomScope::Main,
    };
    let limit = cursor.limit() as usize;
    let before = resolve_cursor(state, cursor.before).await?;
    let rows = parley_db::messages::list_room_messages(
        &state.db,
        room_id,
        scope,
        viewer_id,
        before,
        Utc::now(),
        limit as i64 + 1,
    )
    .await?;
    Ok(page(hydrate(state, rows).await?, limit))
}

pub async fn direct_history(
    state: &AppState,
    viewer_id: i64,
    peer_id: i64,
    cursor: &CursorParams,
) -> Result<CursorResponse<Message>, CoreError> {
    parley_db::users::get_user(&state.db, peer_id)
        .await?
        .ok_or(CoreError::NotFound("user"))?;
    let limit = cursor.limit() as usize;
    let before = resolve_cursor(state, cursor.before).await?;
    let rows = parley_db::messages::list_direct_messages(
        &state.db,
        viewer_id,
        peer_id,
        before,
        Utc::now(),
        limit as i64 + 1,
    )
    .await?;
    Ok(page(hydrate(state, rows).await?, limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::{self, CreateRoom};
    use crate::test_support;
    use crate::ErrorKind;
    use parley_models::room::{RoomSettingsPatch, RoomType};

    /// Alice owns a public room that Bob has joined.
    async fn setup() -> (AppState, i64) {
        let state = test_support::state().await;
        test_support::user(&state, 1, "alice").await;
        test_support::user(&state, 2, "bob").await;
        test_support::user(&state, 3, "carol").await;
        let room = room::create_room(
            &state,
            1,
            &CreateRoom {
                name: "general",
                description: None,
                room_type: RoomType::Public,
                settings: RoomSettings::default(),
            },
        )
        .await
        .unwrap();
        room::join_room(&state, 2, room.id).await.unwrap();
        (state, room.id)
    }

    fn text(room_id: i64, content: &str) -> SendMessagePayload {
        SendMessagePayload {
            room_id: Some(room_id),
            content: Some(content.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn send_broadcasts_to_room_except_origin() {
        let (state, room_id) = setup().await;
        let mut rx = state.event_bus.subscribe();
        let outcome = send_message(&state, 2, &text(room_id, "hi"), Some("conn-b")).await.unwrap();
        assert!(!outcome.scheduled);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, EVENT_MESSAGE_NEW);
        assert_eq!(event.payload["content"], "hi");
        assert_eq!(event.payload["sender"], "2");
        assert!(event.is_for(1, "conn-a", |room| room == room_id));
        assert!(!event.is_for(2, "conn-b", |room| room == room_id));
    }

    #[tokio::test]
    async fn type_specific_rules_are_enforced() {
        let (state, room_id) = setup().await;
        let file = SendMessagePayload {
            kind: Some(MessageKind::File),
            ..text(room_id, "")
        };
        assert_eq!(send_message(&state, 1, &file, None).await.unwrap_err().kind(), ErrorKind::Validation);

        let voice = SendMessagePayload {
            kind: Some(MessageKind::Voice),
            metadata: Some(MessageMetadata { duration: Some(0.0), ..Default::default() }),
            ..text(room_id, "")
        };
        assert_eq!(send_message(&state, 1, &voice, None).await.unwrap_err().kind(), ErrorKind::Validation);

        let ok = SendMessagePayload {
            kind: Some(MessageKind::Voice),
            metadata: Some(MessageMetadata { duration: Some(3.5), ..Default::default() }),
            ..text(room_id, "")
        };
        send_message(&state, 1, &ok, None).await.unwrap();

        assert_eq!(send_message(&state, 1, &text(room_id, "   "), None).await.unwrap_err().kind(), ErrorKind::Validation);
        let neither = SendMessagePayload { content: Some("x".into()), ..Default::default() };
        assert_eq!(send_message(&state, 1, &neither, None).await.unwrap_err().kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn room_settings_gate_message_kinds_and_replies() {
        let (state, room_id) = setup().await;
        let patch = RoomSettingsPatch { allow_gifs: Some(false), allow_replies: Some(false), ..Default::default() };
        room::update_settings(&state, 1, room_id, &patch).await.unwrap();

        let gif = SendMessagePayload {
            kind: Some(MessageKind::Gif),
            metadata: Some(MessageMetadata { file_url: Some("https://media.example/x.gif".into()), ..Default::default() }),
            ..text(room_id, "")
        };
        assert_eq!(send_message(&state, 1, &gif, None).await.unwrap_err().kind(), ErrorKind::Validation);

        let parent = send_message(&state, 1, &text(room_id, "parent"), None).await.unwrap().message;
        let reply = SendMessagePayload { reply_to: Some(parent.id), ..text(room_id, "child") };
        assert_eq!(send_message(&state, 2, &reply, None).await.unwrap_err().kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn non_members_cannot_post() {
        let (state, room_id) = setup().await;
        let err = send_message(&state, 3, &text(room_id, "hi"), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
    }

    #[tokio::test]
    async fn slow_mode_limits_members_but_not_owner() {
        let (state, room_id) = setup().await;
        let patch = RoomSettingsPatch { slow_mode_seconds: Some(30), ..Default::default() };
        room::update_settings(&state, 1, room_id, &patch).await.unwrap();

        send_message(&state, 2, &text(room_id, "one"), None).await.unwrap();
        let err = send_message(&state, 2, &text(room_id, "two"), None).await.unwrap_err();
        assert!(err.to_string().contains("slow mode"));

        send_message(&state, 1, &text(room_id, "one"), None).await.unwrap();
        send_message(&state, 1, &text(room_id, "two"), None).await.unwrap();
    }

    #[tokio::test]
    async fn scheduled_messages_stay_hidden_and_unbroadcast() {
        let (state, room_id) = setup().await;
        let mut rx = state.event_bus.subscribe();
        let later = SendMessagePayload {
            scheduled_for: Some(Utc::now() + Duration::minutes(5)),
            ..text(room_id, "later")
        };
        let outcome = send_message(&state, 1, &later, None).await.unwrap();
        assert!(outcome.scheduled);
        assert!(rx.try_recv().is_err());

        let bob_view = room_history(&state, 2, room_id, None, &CursorParams::default()).await.unwrap();
        assert!(bob_view.items.iter().all(|m| m.id != outcome.message.id));
        let alice_view = room_history(&state, 1, room_id, None, &CursorParams::default()).await.unwrap();
        assert!(alice_view.items.iter().any(|m| m.id == outcome.message.id));

        let past = SendMessagePayload {
            scheduled_for: Some(Utc::now() - Duration::minutes(1)),
            ..text(room_id, "past")
        };
        assert_eq!(send_message(&state, 1, &past, None).await.unwrap_err().kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn expiration_must_be_positive() {
        let (state, room_id) = setup().await;
        let bad = SendMessagePayload { expiration_minutes: Some(0), ..text(room_id, "x") };
        assert_eq!(send_message(&state, 1, &bad, None).await.unwrap_err().kind(), ErrorKind::Validation);

        let good = SendMessagePayload { expiration_minutes: Some(10), ..text(room_id, "x") };
        let message = send_message(&state, 1, &good, None).await.unwrap().message;
        assert!(message.expires_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn reactions_are_idempotent_per_user_and_emoji() {
        let (state, room_id) = setup().await;
        let message = send_message(&state, 1, &text(room_id, "hi"), None).await.unwrap().message;

        let updated = react(&state, 2, message.id, "👍", false).await.unwrap();
        assert_eq!(updated.reactions.len(), 1);
        let err = react(&state, 2, message.id, "👍", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        react(&state, 1, message.id, "👍", false).await.unwrap();
        let updated = react(&state, 2, message.id, "👍", true).await.unwrap();
        assert_eq!(updated.reactions.len(), 1);
        assert_eq!(updated.reactions[0].user_id, 1);
        let err = react(&state, 2, message.id, "👍", true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = react(&state, 3, message.id, "🎉", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
    }

    #[tokio::test]
    async fn pin_requires_moderator_and_updates_room_list() {
        let (state, room_id) = setup().await;
        let message = send_message(&state, 2, &text(room_id, "important"), None).await.unwrap().message;

        let err = pin_message(&state, 2, room_id, message.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
        let err = pin_message(&state, 3, room_id, message.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        let pinned = pin_message(&state, 1, room_id, message.id).await.unwrap();
        assert!(pinned.is_pinned);
        assert_eq!(pinned.pinned_by, Some(1));
        assert_eq!(parley_db::pins::list_room_pin_ids(&state.db, room_id).await.unwrap(), vec![message.id]);

        let err = pin_message(&state, 1, room_id, message.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let unpinned = unpin_message(&state, 1, room_id, message.id).await.unwrap();
        assert!(!unpinned.is_pinned);
        assert!(parley_db::pins::list_room_pin_ids(&state.db, room_id).await.unwrap().is_empty());
        assert_eq!(
            unpin_message(&state, 1, room_id, message.id).await.unwrap_err().kind(),
            ErrorKind::Conflict
        );
    }

    #[tokio::test]
    async fn existing_pins_can_be_removed_after_pinning_is_disabled() {
        let (state, room_id) = setup().await;
        let message = send_message(&state, 2, &text(room_id, "keep"), None).await.unwrap().message;
        let other = send_message(&state, 2, &text(room_id, "later"), None).await.unwrap().message;
        pin_message(&state, 1, room_id, message.id).await.unwrap();

        let patch = RoomSettingsPatch { allow_pins: Some(false), ..Default::default() };
        room::update_settings(&state, 1, room_id, &patch).await.unwrap();
        assert_eq!(
            pin_message(&state, 1, room_id, other.id).await.unwrap_err().kind(),
            ErrorKind::Validation
        );

        let unpinned = unpin_message(&state, 1, room_id, message.id).await.unwrap();
        assert!(!unpinned.is_pinned);
        assert!(parley_db::pins::list_room_pin_ids(&state.db, room_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_pin_list_update_rolls_back_flag() {
        let (state, room_id) = setup().await;
        let message = send_message(&state, 1, &text(room_id, "x"), None).await.unwrap().message;
        sqlx::query("DROP TABLE room_pins").execute(&state.db).await.unwrap();

        let err = pin_message(&state, 1, room_id, message.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        let row = parley_db::messages::get_message(&state.db, message.id).await.unwrap().unwrap();
        assert!(!row.is_pinned);
        assert!(row.pinned_by.is_none());
    }

    #[tokio::test]
    async fn only_sender_edits_and_deletes() {
        let (state, room_id) = setup().await;
        let message = send_message(&state, 2, &text(room_id, "first"), None).await.unwrap().message;

        assert_eq!(edit_message(&state, 1, message.id, "hijack").await.unwrap_err().kind(), ErrorKind::Authorization);
        let edited = edit_message(&state, 2, message.id, "second").await.unwrap();
        assert!(edited.is_edited);
        assert_eq!(edited.content.as_deref(), Some("second"));
        let history = edit_history(&state, 1, message.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "first");

        assert_eq!(delete_message(&state, 1, message.id).await.unwrap_err().kind(), ErrorKind::Authorization);
        let deleted = delete_message(&state, 2, message.id).await.unwrap();
        assert!(deleted.is_deleted);
        assert!(deleted.content.is_none());
        assert_eq!(delete_message(&state, 2, message.id).await.unwrap_err().kind(), ErrorKind::Conflict);
        assert_eq!(edit_message(&state, 2, message.id, "again").await.unwrap_err().kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn deleted_parents_still_resolve_for_replies() {
        let (state, room_id) = setup().await;
        let parent = send_message(&state, 1, &text(room_id, "parent"), None).await.unwrap().message;
        let reply = SendMessagePayload { reply_to: Some(parent.id), ..text(room_id, "child") };
        let child = send_message(&state, 2, &reply, None).await.unwrap().message;
        delete_message(&state, 1, parent.id).await.unwrap();

        let page = room_history(&state, 2, room_id, None, &CursorParams::default()).await.unwrap();
        assert!(page.items.iter().any(|m| m.id == parent.id && m.is_deleted));
        assert!(page.items.iter().any(|m| m.id == child.id && m.reply_to == Some(parent.id)));
    }

    #[tokio::test]
    async fn direct_messages_reach_only_the_pair() {
        let (state, _) = setup().await;
        let mut rx = state.event_bus.subscribe();
        let dm = SendMessagePayload {
            recipient_id: Some(3),
            content: Some("psst".into()),
            ..Default::default()
        };
        send_message(&state, 1, &dm, None).await.unwrap();
        let event = rx.try_recv().unwrap();
        assert!(event.is_for(3, "c3", |_| false));
        assert!(!event.is_for(2, "c2", |_| true));

        let page = direct_history(&state, 3, 1, &CursorParams::default()).await.unwrap();
        assert_eq!(page.items.len(), 1);
        let self_dm = SendMessagePayload { recipient_id: Some(1), ..dm };
        assert_eq!(send_message(&state, 1, &self_dm, None).await.unwrap_err().kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn history_pages_with_before_cursor() {
        let (state, room_id) = setup().await;
        for i in 0..5 {
            send_message(&state, 1, &text(room_id, &format!("m{i}")), None).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(3)).await;
        }
        let first = room_history(&state, 2, room_id, None, &CursorParams { before: None, limit: Some(3) })
            .await
            .unwrap();
        assert_eq!(first.items.len(), 3);
        assert!(first.has_more);
        assert_eq!(first.items[0].content.as_deref(), Some("m4"));

        let second = room_history(
            &state,
            2,
            room_id,
            None,
            &CursorParams { before: first.next_before, limit: Some(3) },
        )
        .await
        .unwrap();
        assert_eq!(second.items.len(), 2);
        assert!(!second.has_more);
        assert_eq!(second.items[1].content.as_deref(), Some("m0"));
    }
}
