use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{MessageKind, MessageMetadata};
use crate::room::MemberRole;

/// One JSON text frame on the realtime connection, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayFrame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl GatewayFrame {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
            ack: None,
        }
    }

    pub fn with_ack(mut self, ack: Option<u64>) -> Self {
        self.ack = ack;
        self
    }
}

// Client -> server events
pub const EVENT_AUTHENTICATE: &str = "authenticate";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_JOIN_ROOM: &str = "joinRoom";
pub const EVENT_LEAVE_ROOM: &str = "leaveRoom";
pub const EVENT_JOIN_CHANNEL: &str = "joinChannel";
pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_REACTION: &str = "reaction";
pub const EVENT_PIN: &str = "pin";
pub const EVENT_UNPIN: &str = "unpin";
pub const EVENT_EDIT: &str = "edit";
pub const EVENT_DELETE: &str = "delete";
pub const EVENT_TYPING: &str = "typing";
pub const EVENT_INVITE_MEMBER: &str = "inviteMember";
pub const EVENT_MARK_READ: &str = "markRead";
pub const EVENT_ESTABLISH_SESSION: &str = "encryption:establish";

// Server -> client replies
pub const EVENT_HELLO: &str = "hello";
pub const EVENT_READY: &str = "ready";
pub const EVENT_HEARTBEAT_ACK: &str = "heartbeat:ack";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_MESSAGE_SENT: &str = "message:sent";
pub const EVENT_MESSAGE_SCHEDULED: &str = "message:scheduled";
pub const EVENT_SESSION_ESTABLISHED: &str = "encryption:established";

// Server -> client broadcasts
pub const EVENT_MESSAGE_NEW: &str = "message:new";
pub const EVENT_MESSAGE_REACTION: &str = "message:reaction";
pub const EVENT_MESSAGE_PINNED: &str = "messagePinned";
pub const EVENT_MESSAGE_UNPINNED: &str = "messageUnpinned";
pub const EVENT_MESSAGE_EDITED: &str = "messageEdited";
pub const EVENT_MESSAGE_DELETED: &str = "messageDeleted";
pub const EVENT_MESSAGE_EXPIRED: &str = "messageExpired";
pub const EVENT_MESSAGES_READ: &str = "messages:read";
pub const EVENT_PRESENCE: &str = "presence";
pub const EVENT_MEMBER_JOINED: &str = "member:joined";
pub const EVENT_MEMBER_LEFT: &str = "member:left";
pub const EVENT_MEMBER_ROLE: &str = "member:role";
pub const EVENT_ROOM_SETTINGS: &str = "room:settings";
pub const EVENT_ROOM_DELETED: &str = "room:deleted";
pub const EVENT_CHANNEL_CREATED: &str = "channel:created";

// Close codes
pub const CLOSE_AUTHENTICATION_FAILED: u16 = 4001;
pub const CLOSE_TOO_MANY_CONNECTIONS: u16 = 4008;
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4009;

#[derive(Debug, Clone, Deserialize)]
pub struct AuthenticatePayload {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    #[serde(with = "crate::id_str")]
    pub room_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRoomPayload {
    #[serde(with = "crate::id_str")]
    pub room_id: i64,
    /// Also give up room membership, not just this connection's subscription.
    #[serde(default)]
    pub leave: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinChannelPayload {
    #[serde(with = "crate::id_str")]
    pub room_id: i64,
    #[serde(with = "crate::id_str")]
    pub channel_id: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    #[serde(default, with = "crate::id_str::option")]
    pub room_id: Option<i64>,
    #[serde(default, with = "crate::id_str::option")]
    pub channel_id: Option<i64>,
    #[serde(default, with = "crate::id_str::option")]
    pub recipient_id: Option<i64>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<MessageKind>,
    #[serde(default)]
    pub metadata: Option<MessageMetadata>,
    #[serde(default, with = "crate::id_str::option")]
    pub reply_to: Option<i64>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expiration_minutes: Option<i64>,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionPayload {
    #[serde(with = "crate::id_str")]
    pub message_id: i64,
    pub emoji: String,
    #[serde(default)]
    pub remove: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinPayload {
    #[serde(with = "crate::id_str")]
    pub room_id: i64,
    #[serde(with = "crate::id_str")]
    pub message_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditPayload {
    #[serde(with = "crate::id_str")]
    pub message_id: i64,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletePayload {
    #[serde(with = "crate::id_str")]
    pub message_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    #[serde(with = "crate::id_str")]
    pub room_id: i64,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteMemberPayload {
    #[serde(with = "crate::id_str")]
    pub room_id: i64,
    pub email: String,
    #[serde(default)]
    pub role: Option<MemberRole>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstablishSessionPayload {
    #[serde(with = "crate::id_str")]
    pub peer_id: i64,
}

/// Body of the scoped `error` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}
