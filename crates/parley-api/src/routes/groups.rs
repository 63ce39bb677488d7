use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use parley_core::room::{self, CreateRoom, InviteReceipt};
use parley_core::AppState;
use parley_models::room::{
    Channel, MemberRole, Room, RoomMember, RoomSettings, RoomSettingsPatch, RoomSnapshot, RoomType,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::middleware::AuthUser;

#[derive(Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub description: Option<String>,
    #[serde(default, rename = "type")]
    pub room_type: Option<RoomType>,
    #[serde(default)]
    pub settings: RoomSettingsPatch,
}

pub async fn create_group(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<Room>), ApiError> {
    let room = room::create_room(
        &state,
        auth.user_id,
        &CreateRoom {
            name: &body.name,
            description: body.description.as_deref(),
            room_type: body.room_type.unwrap_or(RoomType::Private),
            settings: body.settings.apply(RoomSettings::default()),
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(room)))
}

pub async fn list_groups(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Vec<Room>>, ApiError> {
    Ok(Json(room::list_rooms(&state, auth.user_id).await?))
}

pub async fn get_group(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<i64>,
) -> Result<Json<Room>, ApiError> {
    Ok(Json(room::get_room(&state, auth.user_id, room_id).await?))
}

pub async fn delete_group(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    room::delete_room(&state, auth.user_id, room_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn update_settings(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<i64>,
    Json(patch): Json<RoomSettingsPatch>,
) -> Result<Json<Room>, ApiError> {
    Ok(Json(room::update_settings(&state, auth.user_id, room_id, &patch).await?))
}

pub async fn join_group(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<i64>,
) -> Result<Json<RoomSnapshot>, ApiError> {
    Ok(Json(room::join_room(&state, auth.user_id, room_id).await?))
}

pub async fn leave_group(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    room::leave_room(&state, auth.user_id, room_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_members(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<i64>,
) -> Result<Json<Vec<RoomMember>>, ApiError> {
    Ok(Json(room::list_members(&state, auth.user_id, room_id).await?))
}

#[derive(Deserialize)]
pub struct ChangeRoleRequest {
    pub role: MemberRole,
}

pub async fn change_role(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((room_id, user_id)): Path<(i64, i64)>,
    Json(body): Json<ChangeRoleRequest>,
) -> Result<Json<RoomMember>, ApiError> {
    let member = room::change_role(&state, auth.user_id, room_id, user_id, body.role).await?;
    Ok(Json(member))
}

pub async fn remove_member(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((room_id, user_id)): Path<(i64, i64)>,
) -> Result<StatusCode, ApiError> {
    room::remove_member(&state, auth.user_id, room_id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct InviteRequest {
    pub email: String,
    pub role: Option<MemberRole>,
}

pub async fn create_invite(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<i64>,
    Json(body): Json<InviteRequest>,
) -> Result<(StatusCode, Json<InviteReceipt>), ApiError> {
    let receipt = room::invite_member(&state, auth.user_id, room_id, &body.email, body.role).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

pub async fn accept_invite(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(token): Path<String>,
) -> Result<Json<RoomSnapshot>, ApiError> {
    Ok(Json(room::accept_invite(&state, auth.user_id, &token).await?))
}

#[derive(Deserialize)]
pub struct CreateChannelRequest {
    pub name: String,
}

pub async fn create_channel(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<i64>,
    Json(body): Json<CreateChannelRequest>,
) -> Result<(StatusCode, Json<Channel>), ApiError> {
    let channel = room::create_channel(&state, auth.user_id, room_id, &body.name).await?;
    Ok((StatusCode::CREATED, Json(channel)))
}

pub async fn join_channel(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((room_id, channel_id)): Path<(i64, i64)>,
) -> Result<Json<Channel>, ApiError> {
    Ok(Json(room::join_channel(&state, auth.user_id, room_id, channel_id).await?))
}

pub async fn mark_read(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let read_at = room::mark_read(&state, auth.user_id, room_id).await?;
    Ok(Json(json!({ "readAt": read_at })))
}
