use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::user::UserStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    Public,
    Private,
    Direct,
}

impl RoomType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Direct => "direct",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "public" => Some(Self::Public),
            "private" => Some(Self::Private),
            "direct" => Some(Self::Direct),
            _ => None,
        }
    }
}

/// Member roles, ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Member,
    Admin,
    Owner,
}

impl MemberRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Admin => "admin",
            Self::Owner => "owner",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "member" => Some(Self::Member),
            "admin" => Some(Self::Admin),
            "owner" => Some(Self::Owner),
            _ => None,
        }
    }

    /// Owners and admins may pin, unpin and invite.
    pub fn is_moderator(self) -> bool {
        self >= Self::Admin
    }
}

bitflags! {
    /// Per-room feature switches, persisted as a single integer column.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RoomFlags: i64 {
        const ALLOW_REACTIONS  = 1 << 0;
        const ALLOW_REPLIES    = 1 << 1;
        const ALLOW_PINS       = 1 << 2;
        const ALLOW_FILES      = 1 << 3;
        const ALLOW_VOICE      = 1 << 4;
        const ALLOW_GIFS       = 1 << 5;
        const REQUIRE_APPROVAL = 1 << 6;
        const ENCRYPTED        = 1 << 7;
    }
}

impl Default for RoomFlags {
    fn default() -> Self {
        Self::ALLOW_REACTIONS
            | Self::ALLOW_REPLIES
            | Self::ALLOW_PINS
            | Self::ALLOW_FILES
            | Self::ALLOW_VOICE
            | Self::ALLOW_GIFS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSettings {
    pub allow_reactions: bool,
    pub allow_replies: bool,
    pub allow_pins: bool,
    pub allow_files: bool,
    pub allow_voice: bool,
    pub allow_gifs: bool,
    pub require_approval: bool,
    pub encrypted: bool,
    pub slow_mode_seconds: i64,
}

impl RoomSettings {
    pub fn from_parts(flags: RoomFlags, slow_mode_seconds: i64) -> Self {
        Self {
            allow_reactions: flags.contains(RoomFlags::ALLOW_REACTIONS),
            allow_replies: flags.contains(RoomFlags::ALLOW_REPLIES),
            allow_pins: flags.contains(RoomFlags::ALLOW_PINS),
            allow_files: flags.contains(RoomFlags::ALLOW_FILES),
            allow_voice: flags.contains(RoomFlags::ALLOW_VOICE),
            allow_gifs: flags.contains(RoomFlags::ALLOW_GIFS),
            require_approval: flags.contains(RoomFlags::REQUIRE_APPROVAL),
            encrypted: flags.contains(RoomFlags::ENCRYPTED),
            slow_mode_seconds: slow_mode_seconds.max(0),
        }
    }

    pub fn flags(&self) -> RoomFlags {
        let mut flags = RoomFlags::empty();
        flags.set(RoomFlags::ALLOW_REACTIONS, self.allow_reactions);
        flags.set(RoomFlags::ALLOW_REPLIES, self.allow_replies);
        flags.set(RoomFlags::ALLOW_PINS, self.allow_pins);
        flags.set(RoomFlags::ALLOW_FILES, self.allow_files);
        flags.set(RoomFlags::ALLOW_VOICE, self.allow_voice);
        flags.set(RoomFlags::ALLOW_GIFS, self.allow_gifs);
        flags.set(RoomFlags::REQUIRE_APPROVAL, self.require_approval);
        flags.set(RoomFlags::ENCRYPTED, self.encrypted);
        flags
    }
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self::from_parts(RoomFlags::default(), 0)
    }
}

/// Partial settings update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSettingsPatch {
    pub allow_reactions: Option<bool>,
    pub allow_replies: Option<bool>,
    pub allow_pins: Option<bool>,
    pub allow_files: Option<bool>,
    pub allow_voice: Option<bool>,
    pub allow_gifs: Option<bool>,
    pub require_approval: Option<bool>,
    pub encrypted: Option<bool>,
    pub slow_mode_seconds: Option<i64>,
}

impl RoomSettingsPatch {
    pub fn apply(&self, current: RoomSettings) -> RoomSettings {
        RoomSettings {
            allow_reactions: self.allow_reactions.unwrap_or(current.allow_reactions),
            allow_replies: self.allow_replies.unwrap_or(current.allow_replies),
            allow_pins: self.allow_pins.unwrap_or(current.allow_pins),
            allow_files: self.allow_files.unwrap_or(current.allow_files),
            allow_voice: self.allow_voice.unwrap_or(current.allow_voice),
            allow_gifs: self.allow_gifs.unwrap_or(current.allow_gifs),
            require_approval: self.require_approval.unwrap_or(current.require_approval),
            encrypted: self.encrypted.unwrap_or(current.encrypted),
            slow_mode_seconds: self
                .slow_mode_seconds
                .unwrap_or(current.slow_mode_seconds)
                .max(0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    #[serde(with = "crate::id_str")]
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub room_type: RoomType,
    #[serde(with = "crate::id_str")]
    pub owner_id: i64,
    pub settings: RoomSettings,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
    #[serde(with = "crate::id_str")]
    pub user_id: i64,
    pub username: String,
    pub avatar: Option<String>,
    pub status: UserStatus,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    #[serde(with = "crate::id_str")]
    pub id: i64,
    #[serde(with = "crate::id_str")]
    pub room_id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Everything a client needs to render a room right after joining it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room: Room,
    pub members: Vec<RoomMember>,
    pub channels: Vec<Channel>,
    /// Oldest first.
    pub messages: Vec<Message>,
    pub pinned_messages: Vec<Message>,
    pub unread_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip_through_flags() {
        let settings = RoomSettings {
            allow_files: false,
            require_approval: true,
            slow_mode_seconds: 30,
            ..RoomSettings::default()
        };
        let restored = RoomSettings::from_parts(settings.flags(), settings.slow_mode_seconds);
        assert_eq!(restored, settings);
    }

    #[test]
    fn patch_only_touches_given_fields() {
        let patch = RoomSettingsPatch {
            allow_pins: Some(false),
            slow_mode_seconds: Some(-5),
            ..Default::default()
        };
        let updated = patch.apply(RoomSettings::default());
        assert!(!updated.allow_pins);
        assert!(updated.allow_reactions);
        assert_eq!(updated.slow_mode_seconds, 0);
    }

    #[test]
    fn role_ordering_matches_privilege() {
        assert!(MemberRole::Owner > MemberRole::Admin);
        assert!(MemberRole::Admin.is_moderator());
        assert!(!MemberRole::Member.is_moderator());
        assert_eq!(MemberRole::parse("admin"), Some(MemberRole::Admin));
    }
}
