use std::collections::HashSet;

use parley_core::events::ServerEvent;
use parley_models::gateway::{EVENT_MEMBER_LEFT, EVENT_ROOM_DELETED};

/// Typed per-connection state, created once the handshake has authenticated a user.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub user_id: i64,
    pub username: String,
    pub connection_id: String,
    joined_rooms: HashSet<i64>,
}

impl ConnectionContext {
    pub fn new(user_id: i64, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
            connection_id: uuid::Uuid::new_v4().to_string(),
            joined_rooms: HashSet::new(),
        }
    }

    /// Returns true if the room was not already subscribed.
    pub fn subscribe(&mut self, room_id: i64) -> bool {
        self.joined_rooms.insert(room_id)
    }

    pub fn unsubscribe(&mut self, room_id: i64) -> bool {
        self.joined_rooms.remove(&room_id)
    }

    pub fn is_subscribed(&self, room_id: i64) -> bool {
        self.joined_rooms.contains(&room_id)
    }

    pub fn subscribed_rooms(&self) -> Vec<i64> {
        let mut rooms: Vec<i64> = self.joined_rooms.iter().copied().collect();
        rooms.sort_unstable();
        rooms
    }

    pub fn wants(&self, event: &ServerEvent) -> bool {
        event.is_for(self.user_id, &self.connection_id, |room_id| {
            self.joined_rooms.contains(&room_id)
        })
    }

    /// Drop subscriptions the event revokes: this user leaving or being removed, or the room going away.
    pub fn observe(&mut self, event: &ServerEvent) {
        let room_id = || {
            event
                .payload
                .get("roomId")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<i64>().ok())
        };
        match event.event_type.as_str() {
            EVENT_ROOM_DELETED => {
                if let Some(room_id) = room_id() {
                    self.unsubscribe(room_id);
                }
            }
            EVENT_MEMBER_LEFT => {
                let own = event.payload.get("userId").and_then(|v| v.as_str())
                    == Some(self.user_id.to_string().as_str());
                if own {
                    if let Some(room_id) = room_id() {
                        self.unsubscribe(room_id);
                    }
                }
            }
            _ => {}
        }
    }
}
