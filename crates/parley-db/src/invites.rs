use crate::{datetime_from_db_text, datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};
use parley_models::room::MemberRole;
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct InviteRow {
    pub id: i64,
    pub room_id: i64,
    pub token_hash: String,
    pub email: String,
    pub inviter_id: i64,
    pub role: String,
    pub max_uses: Option<i64>,
    pub uses: i64,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for InviteRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let expires_at_raw: String = row.try_get("expires_at")?;
        let created_at_raw: String = row.try_get("created_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            room_id: row.try_get("room_id")?,
            token_hash: row.try_get("token_hash")?,
            email: row.try_get("email")?,
            inviter_id: row.try_get("inviter_id")?,
            role: row.try_get("role")?,
            max_uses: row.try_get("max_uses")?,
            uses: row.try_get("uses")?,
            expires_at: datetime_from_db_text(&expires_at_raw)?,
            created_at: datetime_from_db_text(&created_at_raw)?,
        })
    }
}

impl InviteRow {
    pub fn role(&self) -> MemberRole {
        match MemberRole::parse(&self.role) {
            Some(MemberRole::Owner) | None => MemberRole::Member,
            Some(role) => role,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_uses.is_some_and(|max| self.uses >= max)
    }
}

const INVITE_COLUMNS: &str =
    "id, room_id, token_hash, email, inviter_id, role, max_uses, uses, expires_at, created_at";

pub struct NewInvite<'a> {
    pub id: i64,
    pub room_id: i64,
    pub token_hash: &'a str,
    pub email: &'a str,
    pub inviter_id: i64,
    pub role: MemberRole,
    /// `None` allows unlimited accepts until expiry.
    pub max_uses: Option<i64>,
    pub expires_at: DateTime<Utc>,
}

pub async fn create_invite(
    pool: &DbPool,
    invite: &NewInvite<'_>,
    now: DateTime<Utc>,
) -> Result<InviteRow, DbError> {
    let row = sqlx::query_as::<_, InviteRow>(&format!(
        "INSERT INTO room_invites (id, room_id, token_hash, email, inviter_id, role, max_uses, expires_at, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         RETURNING {INVITE_COLUMNS}"
    ))
    .bind(invite.id)
    .bind(invite.room_id)
    .bind(invite.token_hash)
    .bind(invite.email)
    .bind(invite.inviter_id)
    .bind(invite.role.as_str())
    .bind(invite.max_uses)
    .bind(datetime_to_db_text(invite.expires_at))
    .bind(datetime_to_db_text(now))
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get_invite_by_token_hash(
    pool: &DbPool,
    token_hash: &str,
) -> Result<Option<InviteRow>, DbError> {
    let row = sqlx::query_as::<_, InviteRow>(&format!(
        "SELECT {INVITE_COLUMNS} FROM room_invites WHERE token_hash = $1"
    ))
    .bind(token_hash)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn list_room_invites(pool: &DbPool, room_id: i64) -> Result<Vec<InviteRow>, DbError> {
    let rows = sqlx::query_as::<_, InviteRow>(&format!(
        "SELECT {INVITE_COLUMNS} FROM room_invites WHERE room_id = $1 ORDER BY created_at"
    ))
    .bind(room_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Outcome of [`redeem_invite`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redemption {
    Joined,
    /// Gone, expired or out of uses, even if another accept raced this one.
    Unavailable,
    /// Nothing was consumed.
    AlreadyMember,
}

/// Claim one use and enrol the user in one transaction; an exhausted invite
/// is deleted before commit.
pub async fn redeem_invite(
    pool: &DbPool,
    invite: &InviteRow,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<Redemption, DbError> {
    let now_text = datetime_to_db_text(now);
    let mut tx = pool.begin().await?;
    let claimed = sqlx::query(
        "UPDATE room_invites SET uses = uses + 1
         WHERE id = $1 AND expires_at > $2 AND (max_uses IS NULL OR uses < max_uses)",
    )
    .bind(invite.id)
    .bind(&now_text)
    .execute(&mut *tx)
    .await?;
    if claimed.rows_affected() == 0 {
        return Ok(Redemption::Unavailable);
    }

    let joined = sqlx::query(
        "INSERT INTO room_members (room_id, user_id, role, joined_at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (room_id, user_id) DO NOTHING",
    )
    .bind(invite.room_id)
    .bind(user_id)
    .bind(invite.role().as_str())
    .bind(&now_text)
    .execute(&mut *tx)
    .await?;
    if joined.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(Redemption::AlreadyMember);
    }

    sqlx::query(
        "DELETE FROM room_invites WHERE id = $1 AND max_uses IS NOT NULL AND uses >= max_uses",
    )
    .bind(invite.id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(Redemption::Joined)
}

pub async fn delete_invite(pool: &DbPool, id: i64) -> Result<bool, DbError> {
    let result = sqlx::query("DELETE FROM room_invites WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_expired_invites(pool: &DbPool, now: DateTime<Utc>) -> Result<u64, DbError> {
    let result = sqlx::query("DELETE FROM room_invites WHERE expires_at <= $1")
        .bind(datetime_to_db_text(now))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
