use crate::{
    bool_from_any_row, datetime_from_db_text, datetime_to_db_text, optional_datetime, DbError,
    DbPool,
};
use chrono::{DateTime, Utc};
use parley_models::message::{
    Message, MessageEdit, MessageKind, MessageMetadata, MessageTarget, Reaction,
};
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub room_id: Option<i64>,
    pub channel_id: Option<i64>,
    pub recipient_id: Option<i64>,
    pub sender_id: i64,
    pub content: String,
    pub message_type: String,
    pub metadata: String,
    pub reply_to: Option<i64>,
    pub is_pinned: bool,
    pub pinned_by: Option<i64>,
    pub pinned_at: Option<DateTime<Utc>>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub is_scheduled: bool,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub client_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for MessageRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let created_at_raw: String = row.try_get("created_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            room_id: row.try_get("room_id")?,
            channel_id: row.try_get("channel_id")?,
            recipient_id: row.try_get("recipient_id")?,
            sender_id: row.try_get("sender_id")?,
            content: row.try_get("content")?,
            message_type: row.try_get("message_type")?,
            metadata: row.try_get("metadata")?,
            reply_to: row.try_get("reply_to")?,
            is_pinned: bool_from_any_row(row, "is_pinned")?,
            pinned_by: row.try_get("pinned_by")?,
            pinned_at: optional_datetime(row, "pinned_at")?,
            is_edited: bool_from_any_row(row, "is_edited")?,
            edited_at: optional_datetime(row, "edited_at")?,
            is_deleted: bool_from_any_row(row, "is_deleted")?,
            deleted_at: optional_datetime(row, "deleted_at")?,
            is_scheduled: bool_from_any_row(row, "is_scheduled")?,
            scheduled_for: optional_datetime(row, "scheduled_for")?,
            expires_at: optional_datetime(row, "expires_at")?,
            client_id: row.try_get("client_id")?,
            created_at: datetime_from_db_text(&created_at_raw)?,
        })
    }
}

impl MessageRow {
    pub fn kind(&self) -> MessageKind {
        MessageKind::parse(&self.message_type).unwrap_or(MessageKind::Text)
    }

    pub fn metadata(&self) -> MessageMetadata {
        serde_json::from_str(&self.metadata).unwrap_or_default()
    }

    pub fn cursor(&self) -> HistoryCursor {
        HistoryCursor {
            created_at: self.created_at,
            id: self.id,
        }
    }

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

    /// Build the wire model. Soft-deleted messages keep their id and
    /// position but never expose content or metadata.
    pub fn to_message(&self, reactions: Vec<Reaction>) -> Message {
        let (content, metadata) = if self.is_deleted {
            (None, MessageMetadata::default())
        } else {
            (Some(self.content.clone()), self.metadata())
        };
        Message {
            id: self.id,
            room_id: self.room_id,
            channel_id: self.channel_id,
            recipient_id: self.recipient_id,
            sender_id: self.sender_id,
            content,
            kind: self.kind(),
            metadata,
            reply_to: self.reply_to,
            reactions,
            is_pinned: self.is_pinned,
            pinned_by: self.pinned_by,
            pinned_at: self.pinned_at,
            is_edited: self.is_edited,
            edited_at: self.edited_at,
            is_deleted: self.is_deleted,
            deleted_at: self.deleted_at,
            is_scheduled: self.is_scheduled,
            scheduled_for: self.scheduled_for,
            expires_at: self.expires_at,
            client_id: self.client_id.clone(),
            created_at: self.created_at,
        }
    }
}

// Flags are cast to integers: the Any driver cannot decode SQLite BOOLEAN columns.
const MESSAGE_COLUMNS: &str = "id, room_id, channel_id, recipient_id, sender_id, content, message_type, metadata, reply_to, CASE WHEN is_pinned THEN 1 ELSE 0 END AS is_pinned, pinned_by, pinned_at, CASE WHEN is_edited THEN 1 ELSE 0 END AS is_edited, edited_at, CASE WHEN is_deleted THEN 1 ELSE 0 END AS is_deleted, deleted_at, CASE WHEN is_scheduled THEN 1 ELSE 0 END AS is_scheduled, scheduled_for, expires_at, client_id, created_at";

/// Where a row sits in history order. Timestamps can repeat (a scheduler
/// sweep stamps a whole batch at once), so the id breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryCursor {
    pub created_at: DateTime<Utc>,
    pub id: i64,
}

pub struct NewMessage<'a> {
    pub id: i64,
    pub target: MessageTarget,
    pub sender_id: i64,
    pub content: &'a str,
    pub kind: MessageKind,
    pub metadata: &'a MessageMetadata,
    pub reply_to: Option<i64>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub client_id: Option<&'a str>,
}

pub async fn create_message(
    pool: &DbPool,
    message: &NewMessage<'_>,
    now: DateTime<Utc>,
) -> Result<MessageRow, DbError> {
    let (room_id, channel_id, recipient_id) = match message.target {
        MessageTarget::Room {
            room_id,
            channel_id,
        } => (Some(room_id), channel_id, None),
        MessageTarget::Direct { recipient_id } => (None, None, Some(recipient_id)),
    };
    let metadata = serde_json::to_string(message.metadata)
        .map_err(|e| DbError::Sqlx(sqlx::Error::Protocol(format!("metadata: {e}"))))?;

    let row = sqlx::query_as::<_, MessageRow>(&format!(
        "INSERT INTO messages (id, room_id, channel_id, recipient_id, sender_id, content, message_type, metadata, reply_to, is_scheduled, scheduled_for, expires_at, client_id, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
         RETURNING {MESSAGE_COLUMNS}"
    ))
    .bind(message.id)
    .bind(room_id)
    .bind(channel_id)
    .bind(recipient_id)
    .bind(message.sender_id)
    .bind(message.content)
    .bind(message.kind.as_str())
    .bind(metadata)
    .bind(message.reply_to)
    .bind(message.scheduled_for.is_some())
    .bind(message.scheduled_for.map(datetime_to_db_text))
    .bind(message.expires_at.map(datetime_to_db_text))
    .bind(message.client_id)
    .bind(datetime_to_db_text(now))
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get_message(pool: &DbPool, id: i64) -> Result<Option<MessageRow>, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Which part of a room to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomScope {
    /// Messages posted to the room itself, outside any sub-channel.
    Main,
    Channel(i64),
}

/// A page of room history visible to `viewer_id`, newest first.
///
/// Other users' pending scheduled messages and anything already past its
/// expiry are excluded. Soft-deleted rows stay so replies still resolve.
pub async fn list_room_messages(
    pool: &DbPool,
    room_id: i64,
    scope: RoomScope,
    viewer_id: i64,
    before: Option<HistoryCursor>,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<MessageRow>, DbError> {
    let scope_clause = match scope {
        RoomScope::Main => "channel_id IS NULL",
        RoomScope::Channel(_) => "channel_id = $5",
    };
    let before_param = if matches!(scope, RoomScope::Main) { 5 } else { 6 };
    let before_clause = if before.is_some() {
        before_condition(before_param)
    } else {
        String::new()
    };
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE room_id = $1 AND {scope_clause}
           AND (NOT is_scheduled OR sender_id = $2)
           AND (expires_at IS NULL OR expires_at > $3)
           {before_clause}
         ORDER BY created_at DESC, id DESC
         LIMIT $4"
    );
    let mut query = sqlx::query_as::<_, MessageRow>(&sql)
        .bind(room_id)
        .bind(viewer_id)
        .bind(datetime_to_db_text(now))
        .bind(limit);
    if let RoomScope::Channel(channel_id) = scope {
        query = query.bind(channel_id);
    }
    if let Some(before) = before {
        query = query
            .bind(datetime_to_db_text(before.created_at))
            .bind(before.id);
    }
    Ok(query.fetch_all(pool).await?)
}

/// Strictly older than the cursor in `(created_at, id)` order. Binds two
/// parameters starting at `first`.
fn before_condition(first: usize) -> String {
    let id_param = first + 1;
    format!("AND (created_at < ${first} OR (created_at = ${first} AND id < ${id_param}))")
}

/// History position of a message, if it still exists.
pub async fn history_cursor(pool: &DbPool, id: i64) -> Result<Option<HistoryCursor>, DbError> {
    let created_at: Option<String> =
        sqlx::query_scalar("SELECT created_at FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    match created_at {
        Some(raw) => Ok(Some(HistoryCursor {
            created_at: datetime_from_db_text(&raw)?,
            id,
        })),
        None => Ok(None),
    }
}

/// Direct messages between two users, newest first.
pub async fn list_direct_messages(
    pool: &DbPool,
    user_a: i64,
    user_b: i64,
    before: Option<HistoryCursor>,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<MessageRow>, DbError> {
    let before_clause = if before.is_some() {
        before_condition(5)
    } else {
        String::new()
    };
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE room_id IS NULL
           AND ((sender_id = $1 AND recipient_id = $2) OR (sender_id = $2 AND recipient_id = $1))
           AND (NOT is_scheduled OR sender_id = $1)
           AND (expires_at IS NULL OR expires_at > $3)
           {before_clause}
         ORDER BY created_at DESC, id DESC
         LIMIT $4"
    );
    let mut query = sqlx::query_as::<_, MessageRow>(&sql)
        .bind(user_a)
        .bind(user_b)
        .bind(datetime_to_db_text(now))
        .bind(limit);
    if let Some(before) = before {
        query = query
            .bind(datetime_to_db_text(before.created_at))
            .bind(before.id);
    }
    Ok(query.fetch_all(pool).await?)
}

/// Pinned messages of a room in pin order, resolved through the room's pin list.
pub async fn list_pinned_messages(
    pool: &DbPool,
    room_id: i64,
) -> Result<Vec<MessageRow>, DbError> {
    let rows = sqlx::query_as::<_, MessageRow>(
        "SELECT m.id, m.room_id, m.channel_id, m.recipient_id, m.sender_id, m.content, m.message_type, m.metadata, m.reply_to,
                CASE WHEN m.is_pinned THEN 1 ELSE 0 END AS is_pinned, m.pinned_by, m.pinned_at,
                CASE WHEN m.is_edited THEN 1 ELSE 0 END AS is_edited, m.edited_at,
                CASE WHEN m.is_deleted THEN 1 ELSE 0 END AS is_deleted, m.deleted_at,
                CASE WHEN m.is_scheduled THEN 1 ELSE 0 END AS is_scheduled, m.scheduled_for, m.expires_at, m.client_id, m.created_at
         FROM room_pins p
         INNER JOIN messages m ON m.id = p.message_id
         WHERE p.room_id = $1
         ORDER BY p.pinned_at, p.message_id",
    )
    .bind(room_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Visible messages from other senders newer than `since` (all of them when
/// the member never read the room).
pub async fn count_unread(
    pool: &DbPool,
    room_id: i64,
    viewer_id: i64,
    since: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<i64, DbError> {
    let since_clause = if since.is_some() {
        "AND created_at > $4"
    } else {
        ""
    };
    let sql = format!(
        "SELECT COUNT(*) FROM messages
         WHERE room_id = $1 AND sender_id <> $2
           AND NOT is_scheduled AND NOT is_deleted
           AND (expires_at IS NULL OR expires_at > $3)
           {since_clause}"
    );
    let mut query = sqlx::query_scalar::<_, i64>(&sql)
        .bind(room_id)
        .bind(viewer_id)
        .bind(datetime_to_db_text(now));
    if let Some(since) = since {
        query = query.bind(datetime_to_db_text(since));
    }
    Ok(query.fetch_one(pool).await?)
}

/// Replace the content, keeping the previous text in the edit history.
/// Returns `None` if the message is missing or soft-deleted.
pub async fn edit_message(
    pool: &DbPool,
    id: i64,
    edit_id: i64,
    content: &str,
    now: DateTime<Utc>,
) -> Result<Option<MessageRow>, DbError> {
    let now_text = datetime_to_db_text(now);
    let mut tx = pool.begin().await?;

    let previous: Option<(String,)> =
        sqlx::query_as("SELECT content FROM messages WHERE id = $1 AND NOT is_deleted")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
    let Some((previous,)) = previous else {
        return Ok(None);
    };

    sqlx::query(
        "INSERT INTO message_edits (id, message_id, content, edited_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(edit_id)
    .bind(id)
    .bind(&previous)
    .bind(&now_text)
    .execute(&mut *tx)
    .await?;

    let row = sqlx::query_as::<_, MessageRow>(&format!(
        "UPDATE messages SET content = $2, is_edited = TRUE, edited_at = $3
         WHERE id = $1
         RETURNING {MESSAGE_COLUMNS}"
    ))
    .bind(id)
    .bind(content)
    .bind(&now_text)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(row))
}

/// Earlier versions of a message, oldest first.
pub async fn list_edits(pool: &DbPool, message_id: i64) -> Result<Vec<MessageEdit>, DbError> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT content, edited_at FROM message_edits WHERE message_id = $1 ORDER BY edited_at, id",
    )
    .bind(message_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|(content, edited_at)| {
            Ok(MessageEdit {
                content,
                edited_at: datetime_from_db_text(&edited_at)?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(DbError::from)
}

/// Returns `None` when the message is missing or was already deleted.
pub async fn soft_delete_message(
    pool: &DbPool,
    id: i64,
    now: DateTime<Utc>,
) -> Result<Option<MessageRow>, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(&format!(
        "UPDATE messages SET is_deleted = TRUE, deleted_at = $2
         WHERE id = $1 AND NOT is_deleted
         RETURNING {MESSAGE_COLUMNS}"
    ))
    .bind(id)
    .bind(datetime_to_db_text(now))
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Flip the pin flag on. `None` means the message was already pinned (or is gone).
pub async fn mark_pinned(
    pool: &DbPool,
    id: i64,
    pinned_by: i64,
    now: DateTime<Utc>,
) -> Result<Option<MessageRow>, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(&format!(
        "UPDATE messages SET is_pinned = TRUE, pinned_by = $2, pinned_at = $3
         WHERE id = $1 AND NOT is_pinned
         RETURNING {MESSAGE_COLUMNS}"
    ))
    .bind(id)
    .bind(pinned_by)
    .bind(datetime_to_db_text(now))
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Flip the pin flag off. `None` means the message was not pinned (or is gone).
pub async fn mark_unpinned(pool: &DbPool, id: i64) -> Result<Option<MessageRow>, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(&format!(
        "UPDATE messages SET is_pinned = FALSE, pinned_by = NULL, pinned_at = NULL
         WHERE id = $1 AND is_pinned
         RETURNING {MESSAGE_COLUMNS}"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Put back a previous pin state verbatim; used to undo a half-applied pin.
pub async fn restore_pin_state(
    pool: &DbPool,
    id: i64,
    pinned_by: Option<i64>,
    pinned_at: Option<DateTime<Utc>>,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE messages SET is_pinned = $2, pinned_by = $3, pinned_at = $4 WHERE id = $1",
    )
    .bind(id)
    .bind(pinned_by.is_some())
    .bind(pinned_by)
    .bind(pinned_at.map(datetime_to_db_text))
    .execute(pool)
    .await?;
    Ok(())
}

/// Scheduled messages whose time has come, oldest schedule first.
pub async fn find_due_scheduled(
    pool: &DbPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<MessageRow>, DbError> {
    let rows = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE is_scheduled AND scheduled_for <= $1
         ORDER BY scheduled_for, id
         LIMIT $2"
    ))
    .bind(datetime_to_db_text(now))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Clear the scheduled flag and stamp the send time. Only one caller can win
/// for a given message; the others get `None`.
pub async fn promote_scheduled(
    pool: &DbPool,
    id: i64,
    now: DateTime<Utc>,
) -> Result<Option<MessageRow>, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(&format!(
        "UPDATE messages SET is_scheduled = FALSE, created_at = $2
         WHERE id = $1 AND is_scheduled
         RETURNING {MESSAGE_COLUMNS}"
    ))
    .bind(id)
    .bind(datetime_to_db_text(now))
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn find_expired(
    pool: &DbPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<MessageRow>, DbError> {
    let rows = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE expires_at IS NOT NULL AND expires_at <= $1
         ORDER BY expires_at, id
         LIMIT $2"
    ))
    .bind(datetime_to_db_text(now))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Hard-delete an expired message. Returns the removed row only to the one
/// caller that actually deleted it.
pub async fn delete_expired_message(
    pool: &DbPool,
    id: i64,
    now: DateTime<Utc>,
) -> Result<Option<MessageRow>, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(&format!(
        "DELETE FROM messages
         WHERE id = $1 AND expires_at IS NOT NULL AND expires_at <= $2
         RETURNING {MESSAGE_COLUMNS}"
    ))
    .bind(id)
    .bind(datetime_to_db_text(now))
    .fetch_optional(pool)
    .await?;
    Ok(row)
}
