use crate::{datetime_from_db_text, datetime_to_db_text, optional_datetime, DbError, DbPool};
use chrono::{DateTime, Utc};
use parley_models::room::{MemberRole, RoomMember};
use parley_models::user::UserStatus;
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct MemberRow {
    pub room_id: i64,
    pub user_id: i64,
    pub username: String,
    pub avatar: Option<String>,
    pub status: String,
    pub role: String,
    pub joined_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for MemberRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let joined_at_raw: String = row.try_get("joined_at")?;
        Ok(Self {
            room_id: row.try_get("room_id")?,
            user_id: row.try_get("user_id")?,
            username: row.try_get("username")?,
            avatar: row.try_get("avatar")?,
            status: row.try_get("status")?,
            role: row.try_get("role")?,
            joined_at: datetime_from_db_text(&joined_at_raw)?,
            last_read_at: optional_datetime(row, "last_read_at")?,
        })
    }
}

impl MemberRow {
    pub fn role(&self) -> MemberRole {
        MemberRole::parse(&self.role).unwrap_or(MemberRole::Member)
    }

    pub fn to_member(&self) -> RoomMember {
        RoomMember {
            user_id: self.user_id,
            username: self.username.clone(),
            avatar: self.avatar.clone(),
            status: UserStatus::parse(&self.status).unwrap_or(UserStatus::Offline),
            role: self.role(),
            joined_at: self.joined_at,
            last_read_at: self.last_read_at,
        }
    }
}

const MEMBER_SELECT: &str =
    "SELECT m.room_id, m.user_id, u.username, u.avatar, u.status, m.role, m.joined_at, m.last_read_at
     FROM room_members m
     INNER JOIN users u ON u.id = m.user_id";

/// Returns `false` when the user was already a member.
pub async fn add_member(
    pool: &DbPool,
    room_id: i64,
    user_id: i64,
    role: MemberRole,
    now: DateTime<Utc>,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        "INSERT INTO room_members (room_id, user_id, role, joined_at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (room_id, user_id) DO NOTHING",
    )
    .bind(room_id)
    .bind(user_id)
    .bind(role.as_str())
    .bind(datetime_to_db_text(now))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_member(
    pool: &DbPool,
    room_id: i64,
    user_id: i64,
) -> Result<Option<MemberRow>, DbError> {
    let row = sqlx::query_as::<_, MemberRow>(&format!(
        "{MEMBER_SELECT} WHERE m.room_id = $1 AND m.user_id = $2"
    ))
    .bind(room_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Members in join order.
pub async fn list_members(pool: &DbPool, room_id: i64) -> Result<Vec<MemberRow>, DbError> {
    let rows = sqlx::query_as::<_, MemberRow>(&format!(
        "{MEMBER_SELECT} WHERE m.room_id = $1 ORDER BY m.joined_at, m.user_id"
    ))
    .bind(room_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn member_ids(pool: &DbPool, room_id: i64) -> Result<Vec<i64>, DbError> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT user_id FROM room_members WHERE room_id = $1 ORDER BY joined_at, user_id",
    )
    .bind(room_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// The owner row is never removed here.
pub async fn remove_member(pool: &DbPool, room_id: i64, user_id: i64) -> Result<bool, DbError> {
    let result = sqlx::query(
        "DELETE FROM room_members WHERE room_id = $1 AND user_id = $2 AND role <> 'owner'",
    )
    .bind(room_id)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// The owner's role is never changed here, and nobody is promoted to owner.
pub async fn update_role(
    pool: &DbPool,
    room_id: i64,
    user_id: i64,
    role: MemberRole,
) -> Result<bool, DbError> {
    if role == MemberRole::Owner {
        return Ok(false);
    }
    let result = sqlx::query(
        "UPDATE room_members SET role = $3
         WHERE room_id = $1 AND user_id = $2 AND role <> 'owner'",
    )
    .bind(room_id)
    .bind(user_id)
    .bind(role.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_last_read(
    pool: &DbPool,
    room_id: i64,
    user_id: i64,
    at: DateTime<Utc>,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        "UPDATE room_members SET last_read_at = $3 WHERE room_id = $1 AND user_id = $2",
    )
    .bind(room_id)
    .bind(user_id)
    .bind(datetime_to_db_text(at))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn is_member_by_email(
    pool: &DbPool,
    room_id: i64,
    email: &str,
) -> Result<bool, DbError> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM room_members m
         INNER JOIN users u ON u.id = m.user_id
         WHERE m.room_id = $1 AND LOWER(u.email) = LOWER($2)",
    )
    .bind(room_id)
    .bind(email)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}
