use chrono::Utc;
use parley_db::users::UserRow;
use parley_util::validation::{validate_email, validate_password, validate_username};

use crate::auth::{hash_password, issue_token, password_matches};
use crate::{AppState, CoreError};

/// A freshly authenticated user and their bearer token.
#[derive(Debug)]
pub struct Session {
    pub user: UserRow,
    pub token: String,
}

pub async fn register(
    state: &AppState,
    username: &str,
    email: &str,
    password: &str,
) -> Result<Session, CoreError> {
    if !state.config.registration_enabled {
        return Err(CoreError::forbidden("registration is disabled"));
    }
    let username = username.trim();
    let email = email.trim();
    validate_username(username)?;
    validate_email(email)?;
    validate_password(password)?;

    if parley_db::users::get_user_by_email(&state.db, email).await?.is_some() {
        return Err(CoreError::conflict("email already registered"));
    }
    if parley_db::users::get_user_by_username(&state.db, username).await?.is_some() {
        return Err(CoreError::conflict("username taken"));
    }

    let hash = hash_password(password)?;
    let user = parley_db::users::create_user(&state.db, state.next_id(), username, email, &hash, Utc::now()).await?;
    let token = issue_token(user.id, &state.config.jwt_secret, state.config.jwt_expiry_seconds)?;
    tracing::info!(user_id = user.id, "user registered");
    Ok(Session { user, token })
}

/// Log in by email or username.
pub async fn login(state: &AppState, identifier: &str, password: &str) -> Result<Session, CoreError> {
    let identifier = identifier.trim();
    let user = if identifier.contains('@') {
        parley_db::users::get_user_by_email(&state.db, identifier).await?
    } else {
        parley_db::users::get_user_by_username(&state.db, identifier).await?
    };
    let Some(user) = user.filter(|user| password_matches(password, &user.password_hash)) else {
        return Err(CoreError::Unauthenticated);
    };
    let token = issue_token(user.id, &state.config.jwt_secret, state.config.jwt_expiry_seconds)?;
    Ok(Session { user, token })
}

pub async fn get_user(state: &AppState, user_id: i64) -> Result<UserRow, CoreError> {
    parley_db::users::get_user(&state.db, user_id)
        .await?
        .ok_or(CoreError::NotFound("user"))
}

pub async fn update_profile(
    state: &AppState,
    user_id: i64,
    avatar: Option<&str>,
    preferences: Option<&serde_json::Value>,
) -> Result<UserRow, CoreError> {
    if preferences.is_some_and(|prefs| !prefs.is_object()) {
        return Err(CoreError::validation("preferences must be an object"));
    }
    parley_db::users::update_profile(&state.db, user_id, avatar, preferences)
        .await?
        .ok_or(CoreError::NotFound("user"))
}
