use chrono::{DateTime, Duration, Utc};
use parley_db::invites::Redemption;
use parley_db::members::MemberRow;
use parley_db::messages::RoomScope;
use parley_db::rooms::{NewRoom, RoomRow};
use parley_models::gateway::{
    EVENT_CHANNEL_CREATED, EVENT_MEMBER_JOINED, EVENT_MEMBER_LEFT, EVENT_MEMBER_ROLE,
    EVENT_MESSAGES_READ, EVENT_ROOM_DELETED, EVENT_ROOM_SETTINGS,
};
use parley_models::room::{
    Channel, MemberRole, Room, RoomMember, RoomSettings, RoomSettingsPatch, RoomSnapshot, RoomType,
};
use parley_util::validation::{validate_channel_name, validate_email, validate_room_name};
use rand::RngCore;
use serde_json::json;

use crate::events::to_payload;
use crate::mail::{accept_url, InviteEmail};
use crate::permissions::{can_grant, load_room, require_member, require_role};
use crate::{message, presence, AppState, CoreError};

/// Longest slow-mode interval an owner may configure.
pub const MAX_SLOW_MODE_SECONDS: i64 = 6 * 3600;

pub struct CreateRoom<'a> {
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub room_type: RoomType,
    pub settings: RoomSettings,
}

/// Result of issuing an invitation. The token itself only travels by mail.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteReceipt {
    #[serde(with = "parley_models::id_str")]
    pub invite_id: i64,
    pub email: String,
    pub role: MemberRole,
    pub expires_at: DateTime<Utc>,
}

pub async fn create_room(state: &AppState, owner_id: i64, req: &CreateRoom<'_>) -> Result<Room, CoreError> {
    let name = req.name.trim();
    validate_room_name(name)?;
    if req.settings.slow_mode_seconds > MAX_SLOW_MODE_SECONDS {
        return Err(CoreError::validation("slow mode interval too long"));
    }
    let row = parley_db::rooms::create_room(
        &state.db,
        &NewRoom {
            id: state.next_id(),
            name,
            description: req.description.map(str::trim).filter(|d| !d.is_empty()),
            room_type: req.room_type,
            owner_id,
            settings: req.settings,
        },
        Utc::now(),
    )
    .await?;
    state.member_index.add_member(row.id, owner_id);
    if row.settings().encrypted {
        refresh_encryption(state, row.id).await;
    }
    tracing::info!(room_id = row.id, owner_id, room_type = row.room_type.as_str(), "room created");
    Ok(row.to_room())
}

pub async fn list_rooms(state: &AppState, user_id: i64) -> Result<Vec<Room>, CoreError> {
    let rows = parley_db::rooms::list_user_rooms(&state.db, user_id).await?;
    Ok(rows.iter().map(RoomRow::to_room).collect())
}

/// Room details. Public rooms are visible to everyone, others only to members.
pub async fn get_room(state: &AppState, viewer_id: i64, room_id: i64) -> Result<Room, CoreError> {
    let room = load_room(&state.db, room_id).await?;
    if room.room_type() != RoomType::Public {
        require_member(&state.db, room_id, viewer_id).await?;
    }
    Ok(room.to_room())
}

pub async fn list_members(state: &AppState, viewer_id: i64, room_id: i64) -> Result<Vec<RoomMember>, CoreError> {
    load_room(&state.db, room_id).await?;
    require_member(&state.db, room_id, viewer_id).await?;
    let rows = parley_db::members::list_members(&state.db, room_id).await?;
    Ok(rows.iter().map(MemberRow::to_member).collect())
}

/// Subscribe-time view of a room: members, channels, recent history, pins and unread count.
pub async fn room_snapshot(state: &AppState, room: &RoomRow, member: &MemberRow) -> Result<RoomSnapshot, CoreError> {
    let now = Utc::now();
    let members = parley_db::members::list_members(&state.db, room.id).await?;
    let channels = parley_db::channels::list_channels(&state.db, room.id).await?;
    let mut recent = parley_db::messages::list_room_messages(
        &state.db,
        room.id,
        RoomScope::Main,
        member.user_id,
        None,
        now,
        state.config.snapshot_message_limit,
    )
    .await?;
    recent.reverse();
    let pinned = parley_db::messages::list_pinned_messages(&state.db, room.id).await?;
    let unread_count =
        parley_db::messages::count_unread(&state.db, room.id, member.user_id, member.last_read_at, now).await?;

    Ok(RoomSnapshot {
        room: room.to_room(),
        members: members.iter().map(MemberRow::to_member).collect(),
        channels: channels.iter().map(|c| c.to_channel()).collect(),
        messages: message::hydrate(state, recent).await?,
        pinned_messages: message::hydrate(state, pinned).await?,
        unread_count,
    })
}

/// Subscribe to a room. Public rooms grant membership implicitly unless approval is required.
pub async fn join_room(state: &AppState, user_id: i64, room_id: i64) -> Result<RoomSnapshot, CoreError> {
    let room = load_room(&state.db, room_id).await?;
    let member = match parley_db::members::get_member(&state.db, room_id, user_id).await? {
        Some(member) => member,
        None => implicit_join(state, &room, user_id).await?,
    };
    room_snapshot(state, &room, &member).await
}

async fn implicit_join(state: &AppState, room: &RoomRow, user_id: i64) -> Result<MemberRow, CoreError> {
    if room.room_type() != RoomType::Public {
        return Err(CoreError::forbidden("this room requires an invite"));
    }
    if room.settings().require_approval {
        return Err(CoreError::forbidden("joining this room requires approval"));
    }
    parley_db::members::add_member(&state.db, room.id, user_id, MemberRole::Member, Utc::now()).await?;
    let member = parley_db::members::get_member(&state.db, room.id, user_id)
        .await?
        .ok_or(CoreError::NotFound("member"))?;
    after_member_added(state, room, &member).await;
    Ok(member)
}

async fn after_member_added(state: &AppState, room: &RoomRow, member: &MemberRow) {
    state.member_index.add_member(room.id, member.user_id);
    state.event_bus.dispatch(
        EVENT_MEMBER_JOINED,
        json!({ "roomId": room.id.to_string(), "member": to_payload(&member.to_member()) }),
        room.id,
    );
    if room.settings().encrypted {
        refresh_encryption(state, room.id).await;
    }
    tracing::debug!(room_id = room.id, user_id = member.user_id, "member joined");
}

async fn after_member_removed(state: &AppState, room: &RoomRow, user_id: i64, username: &str) {
    if let Err(err) = parley_db::channels::remove_user_from_room_channels(&state.db, room.id, user_id).await {
        tracing::warn!(room_id = room.id, user_id, error = %err, "failed to clear channel memberships");
    }
    state.member_index.remove_member(room.id, user_id);
    presence::clear_typing_in_room(state, room.id, user_id, username);
    state.event_bus.dispatch(
        EVENT_MEMBER_LEFT,
        json!({ "roomId": room.id.to_string(), "userId": user_id.to_string() }),
        room.id,
    );
    if room.settings().encrypted {
        refresh_encryption(state, room.id).await;
    }
    tracing::debug!(room_id = room.id, user_id, "member left");
}

/// Rebuild the room's pairwise mesh from current membership. Failures are logged.
pub async fn refresh_encryption(state: &AppState, room_id: i64) {
    let members = match parley_db::members::member_ids(&state.db, room_id).await {
        Ok(members) => members,
        Err(err) => {
            tracing::error!(room_id, error = %err, "failed to load members for encryption refresh");
            return;
        }
    };
    for user_id in &members {
        state.encryption.setup_user(*user_id);
    }
    if let Err(err) = state.encryption.update_group_members(room_id, &members) {
        tracing::error!(room_id, error = %err, "failed to rebuild room encryption mesh");
    }
}

/// Give up membership. The owner has to delete the room instead.
pub async fn leave_room(state: &AppState, user_id: i64, room_id: i64) -> Result<(), CoreError> {
    let room = load_room(&state.db, room_id).await?;
    let member = require_member(&state.db, room_id, user_id).await?;
    if member.role() == MemberRole::Owner {
        return Err(CoreError::forbidden("the owner cannot leave; delete the room instead"));
    }
    if parley_db::members::remove_member(&state.db, room_id, user_id).await? {
        after_member_removed(state, &room, user_id, &member.username).await;
    }
    Ok(())
}

pub async fn delete_room(state: &AppState, actor_id: i64, room_id: i64) -> Result<(), CoreError> {
    load_room(&state.db, room_id).await?;
    let actor = require_member(&state.db, room_id, actor_id).await?;
    require_role(&actor, MemberRole::Owner, "delete the room")?;

    let members = parley_db::members::member_ids(&state.db, room_id).await?;
    if !parley_db::rooms::delete_room(&state.db, room_id).await? {
        return Err(CoreError::NotFound("room"));
    }
    state.member_index.remove_room(room_id);
    state.encryption.drop_group(room_id);
    state
        .event_bus
        .dispatch_to_users(EVENT_ROOM_DELETED, json!({ "roomId": room_id.to_string() }), members);
    tracing::info!(room_id, actor_id, "room deleted");
    Ok(())
}

pub async fn remove_member(state: &AppState, actor_id: i64, room_id: i64, target_id: i64) -> Result<(), CoreError> {
    let room = load_room(&state.db, room_id).await?;
    let actor = require_member(&state.db, room_id, actor_id).await?;
    require_role(&actor, MemberRole::Owner, "remove members")?;
    if target_id == room.owner_id {
        return Err(CoreError::forbidden("the owner cannot be removed"));
    }
    let target = parley_db::members::get_member(&state.db, room_id, target_id)
        .await?
        .ok_or(CoreError::NotFound("member"))?;
    if parley_db::members::remove_member(&state.db, room_id, target_id).await? {
        after_member_removed(state, &room, target_id, &target.username).await;
    }
    Ok(())
}

pub async fn change_role(
    state: &AppState,
    actor_id: i64,
    room_id: i64,
    target_id: i64,
    role: MemberRole,
) -> Result<RoomMember, CoreError> {
    let room = load_room(&state.db, room_id).await?;
    let actor = require_member(&state.db, room_id, actor_id).await?;
    require_role(&actor, MemberRole::Owner, "change roles")?;
    if role == MemberRole::Owner {
        return Err(CoreError::validation("ownership cannot be transferred"));
    }
    if target_id == room.owner_id {
        return Err(CoreError::forbidden("the owner's role cannot be changed"));
    }
    if !parley_db::members::update_role(&state.db, room_id, target_id, role).await? {
        return Err(CoreError::NotFound("member"));
    }
    let member = parley_db::members::get_member(&state.db, room_id, target_id)
        .await?
        .ok_or(CoreError::NotFound("member"))?
        .to_member();
    state.event_bus.dispatch(
        EVENT_MEMBER_ROLE,
        json!({ "roomId": room_id.to_string(), "userId": target_id.to_string(), "role": role }),
        room_id,
    );
    Ok(member)
}

pub async fn update_settings(
    state: &AppState,
    actor_id: i64,
    room_id: i64,
    patch: &RoomSettingsPatch,
) -> Result<Room, CoreError> {
    let room = load_room(&state.db, room_id).await?;
    let actor = require_member(&state.db, room_id, actor_id).await?;
    require_role(&actor, MemberRole::Owner, "change room settings")?;

    let previous = room.settings();
    let next = patch.apply(previous);
    if next.slow_mode_seconds > MAX_SLOW_MODE_SECONDS {
        return Err(CoreError::validation("slow mode interval too long"));
    }
    let updated = parley_db::rooms::update_settings(&state.db, room_id, &next)
        .await?
        .ok_or(CoreError::NotFound("room"))?;

    match (previous.encrypted, next.encrypted) {
        (false, true) => refresh_encryption(state, room_id).await,
        (true, false) => {
            state.encryption.drop_group(room_id);
        }
        _ => {}
    }
    state.event_bus.dispatch(
        EVENT_ROOM_SETTINGS,
        json!({ "roomId": room_id.to_string(), "settings": to_payload(&next) }),
        room_id,
    );
    tracing::info!(room_id, actor_id, "room settings updated");
    Ok(updated.to_room())
}

pub async fn create_channel(state: &AppState, actor_id: i64, room_id: i64, name: &str) -> Result<Channel, CoreError> {
    let name = name.trim();
    validate_channel_name(name)?;
    load_room(&state.db, room_id).await?;
    let actor = require_member(&state.db, room_id, actor_id).await?;
    require_role(&actor, MemberRole::Admin, "create channels")?;

    let existing = parley_db::channels::list_channels(&state.db, room_id).await?;
    if existing.iter().any(|c| c.name.eq_ignore_ascii_case(name)) {
        return Err(CoreError::conflict("a channel with that name already exists"));
    }
    let now = Utc::now();
    let channel = parley_db::channels::create_channel(&state.db, state.next_id(), room_id, name, now).await?;
    parley_db::channels::add_channel_member(&state.db, channel.id, actor_id, now).await?;
    let channel = channel.to_channel();
    state
        .event_bus
        .dispatch(EVENT_CHANNEL_CREATED, to_payload(&channel), room_id);
    Ok(channel)
}

pub async fn join_channel(state: &AppState, user_id: i64, room_id: i64, channel_id: i64) -> Result<Channel, CoreError> {
    require_member(&state.db, room_id, user_id).await?;
    let channel = parley_db::channels::get_channel(&state.db, channel_id)
        .await?
        .filter(|c| c.room_id == room_id)
        .ok_or(CoreError::NotFound("channel"))?;
    parley_db::channels::add_channel_member(&state.db, channel_id, user_id, Utc::now()).await?;
    Ok(channel.to_channel())
}

/// Issue an invite token for `email` and hand it to the mailer.
pub async fn invite_member(
    state: &AppState,
    actor_id: i64,
    room_id: i64,
    email: &str,
    role: Option<MemberRole>,
) -> Result<InviteReceipt, CoreError> {
    let email = email.trim();
    validate_email(email)?;
    let room = load_room(&state.db, room_id).await?;
    let actor = require_member(&state.db, room_id, actor_id).await?;
    require_role(&actor, MemberRole::Admin, "invite members")?;
    let role = role.unwrap_or(MemberRole::Member);
    if !can_grant(actor.role(), role) {
        return Err(CoreError::forbidden(format!("cannot invite as {}", role.as_str())));
    }
    if parley_db::members::is_member_by_email(&state.db, room_id, email).await? {
        return Err(CoreError::conflict("that user is already a member"));
    }

    let token = new_invite_token();
    let now = Utc::now();
    let expires_at = now + Duration::days(state.config.invites.ttl_days);
    let invite = parley_db::invites::create_invite(
        &state.db,
        &parley_db::invites::NewInvite {
            id: state.next_id(),
            room_id,
            token_hash: &parley_db::hash_token(&token),
            email,
            inviter_id: actor_id,
            role,
            max_uses: state.config.invites.max_uses,
            expires_at,
        },
        now,
    )
    .await?;

    let mail = InviteEmail {
        to: email.to_string(),
        room_name: room.name.clone(),
        inviter_name: actor.username.clone(),
        accept_url: accept_url(state.config.public_url.as_deref(), &token),
        token,
        expires_at,
    };
    if let Err(err) = state.mailer.send_invite(&mail).await {
        tracing::warn!(room_id, invite_id = invite.id, error = %err, "invite mail failed, withdrawing invite");
        parley_db::invites::delete_invite(&state.db, invite.id).await?;
        return Err(err);
    }
    tracing::info!(room_id, invite_id = invite.id, actor_id, "invite issued");
    Ok(InviteReceipt {
        invite_id: invite.id,
        email: invite.email,
        role,
        expires_at,
    })
}

fn new_invite_token() -> String {
    let mut bytes = [0_u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Redeem an invite token for the calling user.
pub async fn accept_invite(state: &AppState, user_id: i64, token: &str) -> Result<RoomSnapshot, CoreError> {
    let invite = parley_db::invites::get_invite_by_token_hash(&state.db, &parley_db::hash_token(token.trim()))
        .await?
        .ok_or(CoreError::NotFound("invite"))?;
    let now = Utc::now();
    if invite.is_expired(now) {
        parley_db::invites::delete_invite(&state.db, invite.id).await?;
        return Err(CoreError::validation("invite has expired"));
    }
    let user = crate::user::get_user(state, user_id).await?;
    if !user.email.eq_ignore_ascii_case(&invite.email) {
        return Err(CoreError::forbidden("invite was issued to a different email"));
    }
    if parley_db::members::get_member(&state.db, invite.room_id, user_id).await?.is_some() {
        return Err(CoreError::conflict("already a member of this room"));
    }
    let room = load_room(&state.db, invite.room_id).await?;
    match parley_db::invites::redeem_invite(&state.db, &invite, user_id, now).await? {
        Redemption::Joined => {}
        Redemption::Unavailable => return Err(CoreError::validation("invite is no longer valid")),
        Redemption::AlreadyMember => return Err(CoreError::conflict("already a member of this room")),
    }
    let member = parley_db::members::get_member(&state.db, room.id, user_id)
        .await?
        .ok_or(CoreError::NotFound("member"))?;
    after_member_added(state, &room, &member).await;
    tracing::info!(room_id = room.id, user_id, invite_id = invite.id, "invite accepted");
    room_snapshot(state, &room, &member).await
}

/// Move the caller's read marker to now and tell the room.
pub async fn mark_read(state: &AppState, user_id: i64, room_id: i64) -> Result<DateTime<Utc>, CoreError> {
    require_member(&state.db, room_id, user_id).await?;
    let now = Utc::now();
    parley_db::members::set_last_read(&state.db, room_id, user_id, now).await?;
    state.event_bus.dispatch(
        EVENT_MESSAGES_READ,
        json!({ "roomId": room_id.to_string(), "userId": user_id.to_string(), "readAt": now }),
        room_id,
    );
    Ok(now)
}
