use crate::{datetime_from_db_text, datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};
use parley_models::room::{MemberRole, Room, RoomFlags, RoomSettings, RoomType};
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct RoomRow {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub room_type: String,
    pub owner_id: i64,
    pub flags: i64,
    pub slow_mode_seconds: i64,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for RoomRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let created_at_raw: String = row.try_get("created_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            room_type: row.try_get("room_type")?,
            owner_id: row.try_get("owner_id")?,
            flags: row.try_get("flags")?,
            slow_mode_seconds: row.try_get("slow_mode_seconds")?,
            created_at: datetime_from_db_text(&created_at_raw)?,
        })
    }
}

impl RoomRow {
    pub fn room_type(&self) -> RoomType {
        RoomType::parse(&self.room_type).unwrap_or(RoomType::Private)
    }

    pub fn settings(&self) -> RoomSettings {
        RoomSettings::from_parts(
            RoomFlags::from_bits_truncate(self.flags),
            self.slow_mode_seconds,
        )
    }

    pub fn to_room(&self) -> Room {
        Room {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            room_type: self.room_type(),
            owner_id: self.owner_id,
            settings: self.settings(),
            created_at: self.created_at,
        }
    }
}

const ROOM_COLUMNS: &str =
    "id, name, description, room_type, owner_id, flags, slow_mode_seconds, created_at";

pub struct NewRoom<'a> {
    pub id: i64,
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub room_type: RoomType,
    pub owner_id: i64,
    pub settings: RoomSettings,
}

/// Create a room and enrol its owner in one transaction, so a room never
/// exists without its owner as a member.
pub async fn create_room(
    pool: &DbPool,
    room: &NewRoom<'_>,
    now: DateTime<Utc>,
) -> Result<RoomRow, DbError> {
    let now_text = datetime_to_db_text(now);
    let mut tx = pool.begin().await?;
    let row = sqlx::query_as::<_, RoomRow>(&format!(
        "INSERT INTO rooms (id, name, description, room_type, owner_id, flags, slow_mode_seconds, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         RETURNING {ROOM_COLUMNS}"
    ))
    .bind(room.id)
    .bind(room.name)
    .bind(room.description)
    .bind(room.room_type.as_str())
    .bind(room.owner_id)
    .bind(room.settings.flags().bits())
    .bind(room.settings.slow_mode_seconds)
    .bind(&now_text)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO room_members (room_id, user_id, role, joined_at, last_read_at)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(room.id)
    .bind(room.owner_id)
    .bind(MemberRole::Owner.as_str())
    .bind(&now_text)
    .bind(&now_text)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(row)
}

pub async fn get_room(pool: &DbPool, id: i64) -> Result<Option<RoomRow>, DbError> {
    let row = sqlx::query_as::<_, RoomRow>(&format!(
        "SELECT {ROOM_COLUMNS} FROM rooms WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn update_settings(
    pool: &DbPool,
    id: i64,
    settings: &RoomSettings,
) -> Result<Option<RoomRow>, DbError> {
    let row = sqlx::query_as::<_, RoomRow>(&format!(
        "UPDATE rooms SET flags = $2, slow_mode_seconds = $3 WHERE id = $1
         RETURNING {ROOM_COLUMNS}"
    ))
    .bind(id)
    .bind(settings.flags().bits())
    .bind(settings.slow_mode_seconds)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Messages, members, channels, pins and invites go with the room.
pub async fn delete_room(pool: &DbPool, id: i64) -> Result<bool, DbError> {
    let result = sqlx::query("DELETE FROM rooms WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_user_rooms(pool: &DbPool, user_id: i64) -> Result<Vec<RoomRow>, DbError> {
    let rows = sqlx::query_as::<_, RoomRow>(
        "SELECT r.id, r.name, r.description, r.room_type, r.owner_id, r.flags, r.slow_mode_seconds, r.created_at
         FROM rooms r
         INNER JOIN room_members m ON m.room_id = r.id
         WHERE m.user_id = $1
         ORDER BY r.created_at, r.id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Every `(room_id, user_id)` membership pair, for warming in-memory indexes.
pub async fn list_all_memberships(pool: &DbPool) -> Result<Vec<(i64, i64)>, DbError> {
    let rows: Vec<(i64, i64)> = sqlx::query_as("SELECT room_id, user_id FROM room_members")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}
