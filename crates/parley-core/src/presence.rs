use dashmap::DashMap;
use parley_models::gateway::{EVENT_PRESENCE, EVENT_TYPING};
use parley_models::user::UserStatus;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::{AppState, CoreError};

/// Live connections per user. A user is online while at least one remains.
#[derive(Default)]
pub struct PresenceRegistry {
    connections: DashMap<i64, HashSet<String>>,
    /// Held across a registry change and the status write that follows it.
    status_locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn status_lock(&self, user_id: i64) -> Arc<Mutex<()>> {
        self.status_locks.entry(user_id).or_default().clone()
    }

    /// Returns `true` when this is the user's first live connection.
    pub fn register(&self, user_id: i64, connection_id: &str) -> bool {
        let mut entry = self.connections.entry(user_id).or_default();
        let first = entry.is_empty();
        entry.insert(connection_id.to_string());
        first
    }

    /// Returns `true` when the user has no connections left afterwards.
    pub fn unregister(&self, user_id: i64, connection_id: &str) -> bool {
        self.connections
            .remove_if_mut(&user_id, |_, conns| {
                conns.remove(connection_id);
                conns.is_empty()
            })
            .is_some()
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub fn connection_count(&self, user_id: i64) -> usize {
        self.connections.get(&user_id).map_or(0, |conns| conns.len())
    }

    pub fn total_connections(&self) -> usize {
        self.connections.iter().map(|entry| entry.len()).sum()
    }

    pub fn online_users(&self) -> Vec<i64> {
        let mut users: Vec<i64> = self.connections.iter().map(|entry| *entry.key()).collect();
        users.sort_unstable();
        users
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUser {
    #[serde(with = "parley_models::id_str")]
    pub user_id: i64,
    pub username: String,
}

/// Who is typing in which room.
#[derive(Default)]
pub struct TypingRegistry {
    rooms: DashMap<i64, BTreeMap<i64, String>>,
}

impl TypingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update one user's flag and return the room's current typing set.
    pub fn set(&self, room_id: i64, user_id: i64, username: &str, is_typing: bool) -> Vec<TypingUser> {
        let typing = {
            let mut entry = self.rooms.entry(room_id).or_default();
            if is_typing {
                entry.insert(user_id, username.to_string());
            } else {
                entry.remove(&user_id);
            }
            collect(&entry)
        };
        if typing.is_empty() {
            self.rooms.remove_if(&room_id, |_, users| users.is_empty());
        }
        typing
    }

    pub fn tracked_rooms(&self) -> usize {
        self.rooms.len()
    }

    pub fn typing_in(&self, room_id: i64) -> Vec<TypingUser> {
        self.rooms.get(&room_id).map(|e| collect(&e)).unwrap_or_default()
    }

    /// Drop a user from every room. Returns the affected rooms with their remaining sets.
    pub fn clear_user(&self, user_id: i64) -> Vec<(i64, Vec<TypingUser>)> {
        let mut affected = Vec::new();
        for mut entry in self.rooms.iter_mut() {
            if entry.remove(&user_id).is_some() {
                affected.push((*entry.key(), collect(&entry)));
            }
        }
        self.rooms.retain(|_, users| !users.is_empty());
        affected.sort_by_key(|(room_id, _)| *room_id);
        affected
    }

    pub fn clear_room_user(&self, room_id: i64, user_id: i64) -> Option<Vec<TypingUser>> {
        let remaining = {
            let mut entry = self.rooms.get_mut(&room_id)?;
            entry.remove(&user_id)?;
            collect(&entry)
        };
        if remaining.is_empty() {
            self.rooms.remove_if(&room_id, |_, users| users.is_empty());
        }
        Some(remaining)
    }
}

fn collect(users: &BTreeMap<i64, String>) -> Vec<TypingUser> {
    users
        .iter()
        .map(|(user_id, username)| TypingUser {
            user_id: *user_id,
            username: username.clone(),
        })
        .collect()
}

fn typing_payload(room_id: i64, user_id: i64, username: &str, is_typing: bool, typing: &[TypingUser]) -> serde_json::Value {
    serde_json::json!({
        "roomId": room_id.to_string(),
        "userId": user_id.to_string(),
        "username": username,
        "isTyping": is_typing,
        "typingUsers": typing,
    })
}

/// Tell everyone who shares a room with `user_id` about a status change.
pub fn broadcast_presence(state: &AppState, user_id: i64, status: UserStatus) {
    let mut recipients: Vec<i64> = state.member_index.presence_recipients(user_id).into_iter().collect();
    recipients.push(user_id);
    recipients.sort_unstable();
    state.event_bus.dispatch_to_users(
        EVENT_PRESENCE,
        serde_json::json!({ "userId": user_id.to_string(), "status": status }),
        recipients,
    );
}

/// Record a new gateway connection; the first one flips the user online.
pub async fn connect(state: &AppState, user_id: i64, connection_id: &str) -> Result<(), CoreError> {
    let lock = state.presence.status_lock(user_id);
    let _status = lock.lock().await;
    if state.presence.register(user_id, connection_id) {
        parley_db::users::update_status(&state.db, user_id, UserStatus::Online).await?;
        broadcast_presence(state, user_id, UserStatus::Online);
        tracing::debug!(user_id, "user online");
    }
    Ok(())
}

/// Tear down a gateway connection: typing flags go, and the last one flips the user offline.
pub async fn disconnect(
    state: &AppState,
    user_id: i64,
    username: &str,
    connection_id: &str,
) -> Result<(), CoreError> {
    for (room_id, remaining) in state.typing.clear_user(user_id) {
        state.event_bus.dispatch(
            EVENT_TYPING,
            typing_payload(room_id, user_id, username, false, &remaining),
            room_id,
        );
    }
    let lock = state.presence.status_lock(user_id);
    let _status = lock.lock().await;
    if state.presence.unregister(user_id, connection_id) {
        parley_db::users::update_status(&state.db, user_id, UserStatus::Offline).await?;
        broadcast_presence(state, user_id, UserStatus::Offline);
        tracing::debug!(user_id, "user offline");
    }
    Ok(())
}

/// Set or clear a typing flag and broadcast the room's typing set.
pub fn set_typing(
    state: &AppState,
    user_id: i64,
    username: &str,
    room_id: i64,
    is_typing: bool,
    origin: Option<&str>,
) -> Result<Vec<TypingUser>, CoreError> {
    if !state.member_index.is_member(room_id, user_id) {
        return Err(CoreError::forbidden("not a member of this room"));
    }
    let typing = state.typing.set(room_id, user_id, username, is_typing);
    state.event_bus.dispatch_except(
        EVENT_TYPING,
        typing_payload(room_id, user_id, username, is_typing, &typing),
        crate::events::Audience::Room(room_id),
        origin,
    );
    Ok(typing)
}

/// Drop a user's typing flag in one room, e.g. after they leave it.
pub fn clear_typing_in_room(state: &AppState, room_id: i64, user_id: i64, username: &str) {
    if let Some(remaining) = state.typing.clear_room_user(room_id, user_id) {
        state.event_bus.dispatch(
            EVENT_TYPING,
            typing_payload(room_id, user_id, username, false, &remaining),
            room_id,
        );
    }
}
