use axum::{extract::FromRequestParts, http::request::Parts};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use parley_core::AppState;

use crate::error::ApiError;

/// The caller behind a valid `Authorization: Bearer` token.
pub struct AuthUser {
    pub user_id: i64,
    pub username: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| ApiError::Unauthorized)?;
        let user = parley_core::auth::authenticate(state, bearer.token()).await?;
        Ok(AuthUser {
            user_id: user.id,
            username: user.username,
        })
    }
}
