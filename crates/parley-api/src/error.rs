use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parley_core::{CoreError, ErrorKind};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        let kind = match self {
            ApiError::Unauthorized => ErrorKind::Authentication,
            ApiError::Forbidden(_) => ErrorKind::Authorization,
            ApiError::NotFound(_) => ErrorKind::NotFound,
            ApiError::BadRequest(_) => ErrorKind::Validation,
            ApiError::Conflict(_) => ErrorKind::Conflict,
            ApiError::Internal(_) => ErrorKind::Transient,
        };
        let status = match kind {
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::Authorization => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Transient => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, kind.as_str())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = match &self {
            ApiError::Internal(err) => {
                tracing::error!("API internal error: {err:#}");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "code": code, "message": message }))).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Unauthenticated => ApiError::Unauthorized,
            CoreError::Forbidden(msg) => ApiError::Forbidden(msg),
            CoreError::NotFound(what) => ApiError::NotFound(what.to_string()),
            CoreError::Validation(msg) => ApiError::BadRequest(msg),
            CoreError::Conflict(msg) => ApiError::Conflict(msg),
            other => match other.kind() {
                ErrorKind::NotFound => ApiError::NotFound("resource".to_string()),
                ErrorKind::Validation => ApiError::BadRequest(other.public_message()),
                ErrorKind::Authorization => ApiError::Forbidden(other.public_message()),
                ErrorKind::Conflict => ApiError::Conflict(other.public_message()),
                _ => ApiError::Internal(anyhow::Error::new(other)),
            },
        }
    }
}
