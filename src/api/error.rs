//! Control surface error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::core::error::DlpError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Missing or invalid session token")]
    InvalidToken,

    #[error("Bad request: {reason}")]
    BadRequest { reason: String },

    #[error("Server bind failed: {reason}")]
    BindFailed { reason: String },

    #[error(transparent)]
    Service(#[from] DlpError),

    #[error("Internal server error: {reason}")]
    Internal { reason: String },
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidToken => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Service(DlpError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            ApiError::Service(DlpError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ApiError::Service(DlpError::AccessDenied { .. }) => StatusCode::FORBIDDEN,
            ApiError::Service(DlpError::TransientIo { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
