//! Wire error shape: `{status: "error", message: "..."}` with an
//! appropriate HTTP status. Protocol mistakes are 4xx and are never logged
//! as job events; store failures surface as 5xx without touching the
//! daemon's other tasks.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use crab_core::CrabError;
use crab_store::StoreError;

#[derive(Debug)]
pub enum ApiError {
    /// Invalid client request (ProtocolError).
    BadRequest(String),
    NotFound(String),
    /// Anything else, classified by its CrabError kind.
    Internal(CrabError),
}

impl ApiError {
    pub fn protocol(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err.into())
    }
}

impl From<CrabError> for ApiError {
    fn from(err: CrabError) -> Self {
        match err {
            CrabError::Protocol(msg) => ApiError::BadRequest(msg),
            CrabError::Schedule(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, "PROTOCOL_ERROR", message)
            }
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, "NOT_FOUND", message),
            ApiError::Internal(err) => {
                error!("request failed: {err}");
                (StatusCode::INTERNAL_SERVER_ERROR, err.code(), err.to_string())
            }
        };
        let body = Json(serde_json::json!({
            "status": "error",
            "code": code,
            "message": message,
        }));
        (status, body).into_response()
    }
}
