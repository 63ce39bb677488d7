use crate::{datetime_from_db_text, datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};
use parley_models::user::{User, UserProfile, UserStatus};
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub avatar: Option<String>,
    pub status: String,
    pub preferences: String,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for UserRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let created_at_raw: String = row.try_get("created_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            avatar: row.try_get("avatar")?,
            status: row.try_get("status")?,
            preferences: row.try_get("preferences")?,
            created_at: datetime_from_db_text(&created_at_raw)?,
        })
    }
}

impl UserRow {
    pub fn status(&self) -> UserStatus {
        UserStatus::parse(&self.status).unwrap_or(UserStatus::Offline)
    }

    pub fn to_user(&self) -> User {
        User {
            id: self.id,
            username: self.username.clone(),
            avatar: self.avatar.clone(),
            status: self.status(),
        }
    }

    pub fn to_profile(&self) -> UserProfile {
        UserProfile {
            user: self.to_user(),
            email: self.email.clone(),
            preferences: serde_json::from_str(&self.preferences)
                .unwrap_or_else(|_| serde_json::json!({})),
            created_at: self.created_at,
        }
    }
}

const USER_COLUMNS: &str =
    "id, username, email, password_hash, avatar, status, preferences, created_at";

pub async fn create_user(
    pool: &DbPool,
    id: i64,
    username: &str,
    email: &str,
    password_hash: &str,
    now: DateTime<Utc>,
) -> Result<UserRow, DbError> {
    let row = sqlx::query_as::<_, UserRow>(&format!(
        "INSERT INTO users (id, username, email, password_hash, created_at)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING {USER_COLUMNS}"
    ))
    .bind(id)
    .bind(username)
    .bind(email)
    .bind(password_hash)
    .bind(datetime_to_db_text(now))
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get_user(pool: &DbPool, id: i64) -> Result<Option<UserRow>, DbError> {
    let row = sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_user_by_email(pool: &DbPool, email: &str) -> Result<Option<UserRow>, DbError> {
    let row = sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE LOWER(email) = LOWER($1)"
    ))
    .bind(email)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_user_by_username(
    pool: &DbPool,
    username: &str,
) -> Result<Option<UserRow>, DbError> {
    let row = sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
    ))
    .bind(username)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn update_status(pool: &DbPool, id: i64, status: UserStatus) -> Result<(), DbError> {
    let result = sqlx::query("UPDATE users SET status = $2 WHERE id = $1")
        .bind(id)
        .bind(status.as_str())
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

pub async fn update_profile(
    pool: &DbPool,
    id: i64,
    avatar: Option<&str>,
    preferences: Option<&serde_json::Value>,
) -> Result<Option<UserRow>, DbError> {
    let preferences = preferences.map(|value| value.to_string());
    let row = sqlx::query_as::<_, UserRow>(&format!(
        "UPDATE users
         SET avatar = COALESCE($2, avatar),
             preferences = COALESCE($3, preferences)
         WHERE id = $1
         RETURNING {USER_COLUMNS}"
    ))
    .bind(id)
    .bind(avatar)
    .bind(preferences)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Reset everyone to offline; used at startup since presence is process-local.
pub async fn reset_all_statuses(pool: &DbPool) -> Result<u64, DbError> {
    let result = sqlx::query("UPDATE users SET status = 'offline' WHERE status <> 'offline'")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[tokio::test]
    async fn create_and_lookup_user() {
        let pool = test_support::pool().await;
        let created = create_user(&pool, 1, "ada", "Ada@Example.com", "h", Utc::now())
            .await
            .unwrap();
        assert_eq!(created.status(), UserStatus::Offline);

        let by_email = get_user_by_email(&pool, "ada@example.com").await.unwrap();
        assert_eq!(by_email.map(|u| u.id), Some(1));
        assert!(get_user(&pool, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let pool = test_support::pool().await;
        create_user(&pool, 1, "ada", "a@example.com", "h", Utc::now())
            .await
            .unwrap();
        let err = create_user(&pool, 2, "ada", "b@example.com", "h", Utc::now()).await;
        assert!(matches!(err, Err(DbError::Sqlx(_))));
    }

    #[tokio::test]
    async fn status_updates_and_resets() {
        let pool = test_support::pool().await;
        test_support::user(&pool, 1, "ada").await;
        update_status(&pool, 1, UserStatus::Online).await.unwrap();
        assert_eq!(
            get_user(&pool, 1).await.unwrap().unwrap().status(),
            UserStatus::Online
        );
        assert_eq!(reset_all_statuses(&pool).await.unwrap(), 1);
        assert!(matches!(
            update_status(&pool, 99, UserStatus::Away).await,
            Err(DbError::NotFound)
        ));
    }
}
