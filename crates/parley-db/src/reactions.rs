use crate::{datetime_from_db_text, datetime_to_db_text, placeholders, DbError, DbPool};
use chrono::{DateTime, Utc};
use parley_models::message::Reaction;
use std::collections::HashMap;

/// Returns `false` when this user already reacted with this emoji.
pub async fn add_reaction(
    pool: &DbPool,
    message_id: i64,
    user_id: i64,
    emoji: &str,
    now: DateTime<Utc>,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        "INSERT INTO message_reactions (message_id, user_id, emoji, created_at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (message_id, user_id, emoji) DO NOTHING",
    )
    .bind(message_id)
    .bind(user_id)
    .bind(emoji)
    .bind(datetime_to_db_text(now))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Returns `false` when there was nothing to remove.
pub async fn remove_reaction(
    pool: &DbPool,
    message_id: i64,
    user_id: i64,
    emoji: &str,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        "DELETE FROM message_reactions WHERE message_id = $1 AND user_id = $2 AND emoji = $3",
    )
    .bind(message_id)
    .bind(user_id)
    .bind(emoji)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Reactions in the order they were added.
pub async fn list_reactions(pool: &DbPool, message_id: i64) -> Result<Vec<Reaction>, DbError> {
    let rows: Vec<(String, i64, String)> = sqlx::query_as(
        "SELECT emoji, user_id, created_at FROM message_reactions
         WHERE message_id = $1
         ORDER BY created_at, user_id, emoji",
    )
    .bind(message_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|(emoji, user_id, created_at)| to_reaction(emoji, user_id, &created_at))
        .collect()
}

/// Reactions for many messages at once, keyed by message id.
pub async fn list_reactions_for(
    pool: &DbPool,
    message_ids: &[i64],
) -> Result<HashMap<i64, Vec<Reaction>>, DbError> {
    let mut out: HashMap<i64, Vec<Reaction>> = HashMap::new();
    if message_ids.is_empty() {
        return Ok(out);
    }
    let sql = format!(
        "SELECT message_id, emoji, user_id, created_at FROM message_reactions
         WHERE message_id IN ({})
         ORDER BY created_at, user_id, emoji",
        placeholders(1, message_ids.len())
    );
    let mut query = sqlx::query_as::<_, (i64, String, i64, String)>(&sql);
    for id in message_ids {
        query = query.bind(*id);
    }
    for (message_id, emoji, user_id, created_at) in query.fetch_all(pool).await? {
        out.entry(message_id)
            .or_default()
            .push(to_reaction(emoji, user_id, &created_at)?);
    }
    Ok(out)
}

fn to_reaction(emoji: String, user_id: i64, created_at: &str) -> Result<Reaction, DbError> {
    Ok(Reaction {
        emoji,
        user_id,
        created_at: datetime_from_db_text(created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{create_message, NewMessage};
    use crate::rooms::{create_room, NewRoom};
    use crate::test_support;
    use parley_models::message::{MessageKind, MessageMetadata, MessageTarget};
    use parley_models::room::{RoomSettings, RoomType};

    async fn seeded() -> DbPool {
        let pool = test_support::pool().await;
        test_support::user(&pool, 1, "ada").await;
        test_support::user(&pool, 2, "bob").await;
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
        for id in [100, 101] {
            create_message(
                &pool,
                &NewMessage {
                    id,
                    target: MessageTarget::Room {
                        room_id: 10,
                        channel_id: None,
                    },
                    sender_id: 1,
                    content: "hello",
                    kind: MessageKind::Text,
                    metadata: &MessageMetadata::default(),
                    reply_to: None,
                    scheduled_for: None,
                    expires_at: None,
                    client_id: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn duplicate_add_and_missing_remove_report_false() {
        let pool = seeded().await;
        assert!(add_reaction(&pool, 100, 2, "👍", Utc::now()).await.unwrap());
        assert!(!add_reaction(&pool, 100, 2, "👍", Utc::now()).await.unwrap());
        assert!(add_reaction(&pool, 100, 1, "👍", Utc::now()).await.unwrap());
        assert_eq!(list_reactions(&pool, 100).await.unwrap().len(), 2);

        assert!(remove_reaction(&pool, 100, 2, "👍").await.unwrap());
        assert!(!remove_reaction(&pool, 100, 2, "👍").await.unwrap());
    }

    #[tokio::test]
    async fn batch_listing_groups_by_message() {
        let pool = seeded().await;
        add_reaction(&pool, 100, 1, "🎉", Utc::now()).await.unwrap();
        add_reaction(&pool, 101, 2, "👀", Utc::now()).await.unwrap();
        add_reaction(&pool, 101, 1, "👀", Utc::now()).await.unwrap();
        let grouped = list_reactions_for(&pool, &[100, 101, 102]).await.unwrap();
        assert_eq!(grouped.get(&100).map(Vec::len), Some(1));
        assert_eq!(grouped.get(&101).map(Vec::len), Some(2));
        assert!(grouped.get(&102).is_none());
        assert!(list_reactions_for(&pool, &[]).await.unwrap().is_empty());
    }
}
