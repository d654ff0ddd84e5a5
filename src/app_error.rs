use crate::config::models::RegistryError;
use crate::config::settings::SettingsError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Error envelope for the non-streaming endpoints. Streaming endpoints
/// report failures in-band as a terminal `fail` line instead.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl From<RegistryError> for ApiError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::NotFound(_) => ApiError::NotFound(error.to_string()),
            RegistryError::Io(_) | RegistryError::Malformed(_) => {
                ApiError::Internal(error.to_string())
            }
        }
    }
}

impl From<SettingsError> for ApiError {
    fn from(error: SettingsError) -> Self {
        ApiError::Internal(error.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    result: &'static str,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody { result: "fail", error: self.to_string() };
        (status, Json(body)).into_response()
    }
}
