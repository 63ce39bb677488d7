use serde::Serialize;
use tokio::sync::broadcast;

/// Serialize an event body. Domain types always serialize; a failure is logged and sent as null.
pub fn to_payload<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|err| {
        tracing::error!(error = %err, "failed to serialize event payload");
        serde_json::Value::Null
    })
}

/// Who should receive a [`ServerEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Every connection currently subscribed to the room.
    Room(i64),
    /// Every connection belonging to one of these users.
    Users(Vec<i64>),
}

#[derive(Debug, Clone)]
pub struct ServerEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub audience: Audience,
    /// Connection that triggered the event and already has its own reply.
    pub exclude_connection: Option<String>,
}

impl ServerEvent {
    /// Whether a connection of `user_id` subscribed to `joined_rooms` gets this event.
    pub fn is_for(&self, user_id: i64, connection_id: &str, is_joined: impl Fn(i64) -> bool) -> bool {
        if self.exclude_connection.as_deref() == Some(connection_id) {
            return false;
        }
        match &self.audience {
            Audience::Room(room_id) => is_joined(*room_id),
            Audience::Users(users) => users.contains(&user_id),
        }
    }
}

/// Broadcast-based event bus for real-time fan-out to gateway sessions.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: ServerEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    pub fn dispatch(&self, event_type: &str, payload: serde_json::Value, room_id: i64) {
        self.dispatch_except(event_type, payload, Audience::Room(room_id), None);
    }

    pub fn dispatch_to_users(&self, event_type: &str, payload: serde_json::Value, user_ids: Vec<i64>) {
        self.dispatch_except(event_type, payload, Audience::Users(user_ids), None);
    }

    pub fn dispatch_except(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        audience: Audience,
        exclude_connection: Option<&str>,
    ) {
        self.publish(ServerEvent {
            event_type: event_type.to_string(),
            payload,
            audience,
            exclude_connection: exclude_connection.map(str::to_string),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
