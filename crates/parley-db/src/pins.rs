use crate::{datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};

/// Append a message to the room's pin list. Returns `false` when it was
/// already listed.
pub async fn add_room_pin(
    pool: &DbPool,
    room_id: i64,
    message_id: i64,
    pinned_by: i64,
    now: DateTime<Utc>,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        "INSERT INTO room_pins (room_id, message_id, pinned_by, pinned_at)
         SELECT $1, $2, $3, $4
         WHERE EXISTS (SELECT 1 FROM messages WHERE id = $2 AND room_id = $1)
         ON CONFLICT (room_id, message_id) DO NOTHING",
    )
    .bind(room_id)
    .bind(message_id)
    .bind(pinned_by)
    .bind(datetime_to_db_text(now))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn remove_room_pin(pool: &DbPool, room_id: i64, message_id: i64) -> Result<bool, DbError> {
    let result = sqlx::query("DELETE FROM room_pins WHERE room_id = $1 AND message_id = $2")
        .bind(room_id)
        .bind(message_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// The room's pinned message ids in pin order.
pub async fn list_room_pin_ids(pool: &DbPool, room_id: i64) -> Result<Vec<i64>, DbError> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT message_id FROM room_pins WHERE room_id = $1 ORDER BY pinned_at, message_id",
    )
    .bind(room_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}
