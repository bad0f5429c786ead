//! HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::auth::TokenError;
use crate::users::UserError;

/// Errors returned by HTTP handlers, rendered as `{"message": ...}`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid request (400).
    #[error("{0}")]
    BadRequest(String),

    /// Missing or rejected credentials (401).
    #[error("{0}")]
    Unauthorized(&'static str),

    /// Server-side failure (500).
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<UserError> for ApiError {
    fn from(err: UserError) -> Self {
        match err {
            UserError::NameRequired | UserError::Duplicate(_) => {
                ApiError::BadRequest(err.to_string())
            }
            UserError::Storage(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(serde_json::json!({ "message": self.to_string() }));
        (status, body).into_response()
    }
}
