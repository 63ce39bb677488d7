//! Password storage and bearer tokens for the REST and gateway surfaces.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use parley_db::users::UserRow;
use serde::{Deserialize, Serialize};

use crate::{AppState, CoreError};

/// Bearer token body. `sub` is the user id in decimal, like every id on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    sub: String,
    iat: i64,
    exp: i64,
}

pub(crate) fn hash_password(password: &str) -> Result<String, CoreError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| CoreError::Internal(format!("password hashing failed: {err}")))
}

/// A stored hash that does not parse never matches.
pub(crate) fn password_matches(password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(err) => {
            tracing::warn!(error = %err, "unreadable password hash");
            false
        }
    }
}

pub fn issue_token(user_id: i64, secret: &str, ttl_seconds: u64) -> Result<String, CoreError> {
    let issued = Utc::now();
    let expires = i64::try_from(ttl_seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|ttl| issued.checked_add_signed(ttl))
        .ok_or_else(|| CoreError::Internal(format!("token lifetime of {ttl_seconds}s is out of range")))?;
    let claims = TokenClaims {
        sub: user_id.to_string(),
        iat: issued.timestamp(),
        exp: expires.timestamp(),
    };
    jsonwebtoken::encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|err| CoreError::Internal(format!("token signing failed: {err}")))
}

/// The user a token was issued to, or `None` for a bad signature, a malformed body or an expired token.
fn token_subject(token: &str, secret: &str) -> Option<i64> {
    let decoded = jsonwebtoken::decode::<TokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    );
    match decoded {
        Ok(data) => data.claims.sub.parse().ok(),
        Err(err) => {
            tracing::debug!(error = %err, "bearer token rejected");
            None
        }
    }
}

/// Resolve a bearer token to a stored user. Tokens for deleted users fail.
pub async fn authenticate(state: &AppState, token: &str) -> Result<UserRow, CoreError> {
    let user_id = token_subject(token, &state.config.jwt_secret).ok_or(CoreError::Unauthenticated)?;
    parley_db::users::get_user(&state.db, user_id)
        .await?
        .ok_or(CoreError::Unauthenticated)
}
