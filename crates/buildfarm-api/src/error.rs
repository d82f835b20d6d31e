//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<buildfarm_core::Error> for ApiError {
    fn from(err: buildfarm_core::Error) -> Self {
        match err {
            buildfarm_core::Error::UnknownBuilder(_) | buildfarm_core::Error::UnknownBuild(_) => {
                ApiError::NotFound(err.to_string())
            }
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<buildfarm_config::ConfigError> for ApiError {
    fn from(err: buildfarm_config::ConfigError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}
