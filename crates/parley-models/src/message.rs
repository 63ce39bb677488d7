use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    File,
    Voice,
    Gif,
    Image,
    Audio,
    Video,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::File => "file",
            Self::Voice => "voice",
            Self::Gif => "gif",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(Self::Text),
            "file" => Some(Self::File),
            "voice" => Some(Self::Voice),
            "gif" => Some(Self::Gif),
            "image" => Some(Self::Image),
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            _ => None,
        }
    }

    /// Kinds that carry an uploaded file and are gated by the room's file setting.
    pub fn is_upload(self) -> bool {
        matches!(self, Self::File | Self::Image | Self::Audio | Self::Video)
    }
}

/// Type-specific message details. Which fields are meaningful depends on
/// the [`MessageKind`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Voice/audio length in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji: String,
    #[serde(with = "crate::id_str")]
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEdit {
    pub content: String,
    pub edited_at: DateTime<Utc>,
}

/// Where a message is delivered. Exactly one topology applies per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget {
    Room { room_id: i64, channel_id: Option<i64> },
    Direct { recipient_id: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(with = "crate::id_str")]
    pub id: i64,
    #[serde(default, with = "crate::id_str::option")]
    pub room_id: Option<i64>,
    #[serde(default, with = "crate::id_str::option")]
    pub channel_id: Option<i64>,
    #[serde(default, with = "crate::id_str::option")]
    pub recipient_id: Option<i64>,
    #[serde(rename = "sender", with = "crate::id_str")]
    pub sender_id: i64,
    /// Withheld once the message is soft-deleted.
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub metadata: MessageMetadata,
    #[serde(default, with = "crate::id_str::option")]
    pub reply_to: Option<i64>,
    pub reactions: Vec<Reaction>,
    pub is_pinned: bool,
    #[serde(default, with = "crate::id_str::option")]
    pub pinned_by: Option<i64>,
    pub pinned_at: Option<DateTime<Utc>>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub is_scheduled: bool,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Client-supplied id used to reconcile optimistic copies.
    pub client_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn target(&self) -> Option<MessageTarget> {
        match (self.room_id, self.recipient_id) {
            (Some(room_id), None) => Some(MessageTarget::Room {
                room_id,
                channel_id: self.channel_id,
            }),
            (None, Some(recipient_id)) => Some(MessageTarget::Direct { recipient_id }),
            _ => None,
        }
    }
}
