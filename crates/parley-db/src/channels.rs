use crate::{datetime_from_db_text, datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};
use parley_models::room::Channel;
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct ChannelRow {
    pub id: i64,
    pub room_id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for ChannelRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let created_at_raw: String = row.try_get("created_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            room_id: row.try_get("room_id")?,
            name: row.try_get("name")?,
            created_at: datetime_from_db_text(&created_at_raw)?,
        })
    }
}

impl ChannelRow {
    pub fn to_channel(&self) -> Channel {
        Channel {
            id: self.id,
            room_id: self.room_id,
            name: self.name.clone(),
            created_at: self.created_at,
        }
    }
}

pub async fn create_channel(
    pool: &DbPool,
    id: i64,
    room_id: i64,
    name: &str,
    now: DateTime<Utc>,
) -> Result<ChannelRow, DbError> {
    let row = sqlx::query_as::<_, ChannelRow>(
        "INSERT INTO channels (id, room_id, name, created_at)
         VALUES ($1, $2, $3, $4)
         RETURNING id, room_id, name, created_at",
    )
    .bind(id)
    .bind(room_id)
    .bind(name)
    .bind(datetime_to_db_text(now))
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get_channel(pool: &DbPool, id: i64) -> Result<Option<ChannelRow>, DbError> {
    let row = sqlx::query_as::<_, ChannelRow>(
        "SELECT id, room_id, name, created_at FROM channels WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn list_channels(pool: &DbPool, room_id: i64) -> Result<Vec<ChannelRow>, DbError> {
    let rows = sqlx::query_as::<_, ChannelRow>(
        "SELECT id, room_id, name, created_at FROM channels
         WHERE room_id = $1 ORDER BY created_at, id",
    )
    .bind(room_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn add_channel_member(
    pool: &DbPool,
    channel_id: i64,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        "INSERT INTO channel_members (channel_id, user_id, joined_at)
         VALUES ($1, $2, $3)
         ON CONFLICT (channel_id, user_id) DO NOTHING",
    )
    .bind(channel_id)
    .bind(user_id)
    .bind(datetime_to_db_text(now))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn remove_user_from_room_channels(
    pool: &DbPool,
    room_id: i64,
    user_id: i64,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        "DELETE FROM channel_members
         WHERE user_id = $2 AND channel_id IN (SELECT id FROM channels WHERE room_id = $1)",
    )
    .bind(room_id)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn is_channel_member(
    pool: &DbPool,
    channel_id: i64,
    user_id: i64,
) -> Result<bool, DbError> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM channel_members WHERE channel_id = $1 AND user_id = $2",
    )
    .bind(channel_id)
    .bind(user_id)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::{create_room, NewRoom};
    use crate::test_support;
    use parley_models::room::{RoomSettings, RoomType};

    #[tokio::test]
    async fn channels_belong_to_rooms() {
        let pool = test_support::pool().await;
        test_support::user(&pool, 1, "ada").await;
        create_room(
            &pool,
            &NewRoom {
                id: 10,
                name: "room",
                description: None,
                room_type: RoomType::Public,
                owner_id: 1,
                settings: RoomSettings::default(),
            },
            Utc::now(),
        )
        .await
        .unwrap();

        let channel = create_channel(&pool, 20, 10, "design", Utc::now()).await.unwrap();
        assert_eq!(channel.room_id, 10);
        assert!(create_channel(&pool, 21, 10, "design", Utc::now()).await.is_err());

        assert!(add_channel_member(&pool, 20, 1, Utc::now()).await.unwrap());
        assert!(!add_channel_member(&pool, 20, 1, Utc::now()).await.unwrap());
        assert!(is_channel_member(&pool, 20, 1).await.unwrap());

        assert_eq!(remove_user_from_room_channels(&pool, 10, 1).await.unwrap(), 1);
        assert!(!is_channel_member(&pool, 20, 1).await.unwrap());
        assert_eq!(list_channels(&pool, 10).await.unwrap().len(), 1);
    }
}
