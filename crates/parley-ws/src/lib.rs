mod handler;
mod limits;
mod session;

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header::AUTHORIZATION, HeaderMap},
    response::IntoResponse,
    routing::get,
    Extension, Router,
};
use parley_core::AppState;
use serde::Deserialize;

pub use limits::GatewayConfig;
pub use session::ConnectionContext;

use limits::Gateway;

/// Mounts the realtime endpoint at `/gateway`.
pub fn gateway_router(config: GatewayConfig) -> Router<AppState> {
    Router::new()
        .route("/gateway", get(ws_upgrade))
        .layer(Extension(Gateway::new(config)))
}

#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(gateway): Extension<Arc<Gateway>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = params.token.or_else(|| bearer_token(&headers));
    ws.on_upgrade(move |socket| handler::handle_connection(socket, state, gateway, token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_header_is_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(bearer_token(&headers).is_none());
    }
}
