use axum::{
    extract::{Path, Query, State},
    Json,
};
use parley_core::{message, AppState};
use parley_models::message::{Message, MessageEdit};
use parley_util::pagination::{CursorParams, CursorResponse};
use serde::Deserialize;

use crate::error::ApiError;
use crate::middleware::AuthUser;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    /// Id of the oldest message already seen.
    pub before: Option<i64>,
    pub limit: Option<u32>,
    pub channel_id: Option<i64>,
}

impl HistoryQuery {
    fn cursor(&self) -> CursorParams {
        CursorParams {
            before: self.before,
            limit: self.limit,
        }
    }
}

pub async fn room_history(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<CursorResponse<Message>>, ApiError> {
    let page = message::room_history(&state, auth.user_id, room_id, query.channel_id, &query.cursor()).await?;
    Ok(Json(page))
}

pub async fn direct_history(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(peer_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<CursorResponse<Message>>, ApiError> {
    let page = message::direct_history(&state, auth.user_id, peer_id, &query.cursor()).await?;
    Ok(Json(page))
}

pub async fn edit_history(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(message_id): Path<i64>,
) -> Result<Json<Vec<MessageEdit>>, ApiError> {
    Ok(Json(message::edit_history(&state, auth.user_id, message_id).await?))
}
