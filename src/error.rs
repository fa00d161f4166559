use std::fmt;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

/// Request-level failures with their wire mapping.
///
/// Everything the activity pipeline can reject maps onto one of these before
/// any store write happens. Delivery failures never surface here.
#[derive(Debug)]
pub(crate) enum ApiError {
    BadRequest(String),
    Unauthorized,
    Forbidden,
    NotFound,
    /// Tombstone read; carries the tombstone payload for the 410 body.
    Gone(Value),
    Conflict(String),
    Upstream(String),
    Internal(anyhow::Error),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            ApiError::Unauthorized => write!(f, "unauthorized"),
            ApiError::Forbidden => write!(f, "forbidden"),
            ApiError::NotFound => write!(f, "not found"),
            ApiError::Gone(_) => write!(f, "gone"),
            ApiError::Conflict(msg) => write!(f, "conflict: {msg}"),
            ApiError::Upstream(msg) => write!(f, "upstream failure: {msg}"),
            ApiError::Internal(error) => write!(f, "internal error: {error:#}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        ApiError::Internal(error)
    }
}

impl ApiError {
    pub(crate) fn bad_request(msg: impl Into<String>) -> ApiError {
        ApiError::BadRequest(msg.into())
    }

    pub(crate) fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Gone(_) => StatusCode::GONE,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(error) = &self {
            tracing::error!(target: "http", %error, "request failed");
        }
        let status = self.status();
        match self {
            ApiError::Gone(tombstone) => {
                let body = crate::http::with_context(tombstone);
                crate::http::ActivityJson(status, Json(body)).into_response()
            }
            other => (status, Json(json!({"error": other.to_string()}))).into_response(),
        }
    }
}
