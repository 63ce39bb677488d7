use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use parley_core::{e2ee, user, AppState};
use parley_models::user::{User, UserProfile};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;
use crate::middleware::AuthUser;

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    /// Email address or username.
    #[serde(alias = "email", alias = "username")]
    pub identifier: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserProfile,
}

impl From<user::Session> for AuthResponse {
    fn from(session: user::Session) -> Self {
        Self {
            token: session.token,
            user: session.user.to_profile(),
        }
    }
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), ApiError> {
    let session = user::register(&state, &body.username, &body.email, &body.password).await?;
    Ok((StatusCode::CREATED, Json(session.into())))
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let session = user::login(&state, &body.identifier, &body.password).await?;
    Ok(Json(session.into()))
}

pub async fn get_me(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<UserProfile>, ApiError> {
    let row = user::get_user(&state, auth.user_id).await?;
    Ok(Json(row.to_profile()))
}

#[derive(Deserialize)]
pub struct UpdateMeRequest {
    pub avatar: Option<String>,
    pub preferences: Option<Value>,
}

pub async fn update_me(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<UpdateMeRequest>,
) -> Result<Json<UserProfile>, ApiError> {
    let row = user::update_profile(
        &state,
        auth.user_id,
        body.avatar.as_deref(),
        body.preferences.as_ref(),
    )
    .await?;
    Ok(Json(row.to_profile()))
}

pub async fn get_user(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(user_id): Path<i64>,
) -> Result<Json<User>, ApiError> {
    let row = user::get_user(&state, user_id).await?;
    Ok(Json(row.to_user()))
}

pub async fn setup_encryption(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<e2ee::PreKeyBundle>, ApiError> {
    Ok(Json(e2ee::setup_identity(&state, auth.user_id).await?))
}

pub async fn get_prekey_bundle(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(user_id): Path<i64>,
) -> Result<Json<e2ee::PreKeyBundle>, ApiError> {
    Ok(Json(e2ee::fetch_bundle(&state, user_id).await?))
}
