use axum::{
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use parley_core::AppState;
use serde_json::json;
use tower_http::trace::TraceLayer;

pub mod error;
pub mod middleware;
pub mod routes;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health))
        // Users
        .route("/api/users/register", post(routes::users::register))
        .route("/api/users/login", post(routes::users::login))
        .route(
            "/api/users/@me",
            get(routes::users::get_me).patch(routes::users::update_me),
        )
        .route(
            "/api/users/@me/encryption",
            post(routes::users::setup_encryption),
        )
        .route("/api/users/{user_id}", get(routes::users::get_user))
        .route(
            "/api/users/{user_id}/prekey-bundle",
            get(routes::users::get_prekey_bundle),
        )
        // Groups
        .route(
            "/api/groups",
            get(routes::groups::list_groups).post(routes::groups::create_group),
        )
        .route(
            "/api/groups/invites/{token}/accept",
            post(routes::groups::accept_invite),
        )
        .route(
            "/api/groups/{room_id}",
            get(routes::groups::get_group).delete(routes::groups::delete_group),
        )
        .route(
            "/api/groups/{room_id}/settings",
            patch(routes::groups::update_settings),
        )
        .route("/api/groups/{room_id}/join", post(routes::groups::join_group))
        .route("/api/groups/{room_id}/leave", post(routes::groups::leave_group))
        .route(
            "/api/groups/{room_id}/members",
            get(routes::groups::list_members),
        )
        .route(
            "/api/groups/{room_id}/members/{user_id}",
            patch(routes::groups::change_role).delete(routes::groups::remove_member),
        )
        .route(
            "/api/groups/{room_id}/invites",
            post(routes::groups::create_invite),
        )
        .route(
            "/api/groups/{room_id}/channels",
            post(routes::groups::create_channel),
        )
        .route(
            "/api/groups/{room_id}/channels/{channel_id}/join",
            post(routes::groups::join_channel),
        )
        .route(
            "/api/groups/{room_id}/messages",
            get(routes::messages::room_history),
        )
        .route("/api/groups/{room_id}/read", post(routes::groups::mark_read))
        // Messages
        .route(
            "/api/messages/direct/{user_id}",
            get(routes::messages::direct_history),
        )
        .route(
            "/api/messages/{message_id}/history",
            get(routes::messages::edit_history),
        )
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer())
}

fn build_cors_layer() -> tower_http::cors::CorsLayer {
    tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}

async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "service": "parley" })),
    )
}
