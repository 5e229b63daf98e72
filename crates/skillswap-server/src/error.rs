use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use skillswap_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored bytes no longer match their digest. The detail stays in logs.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    TransientIo(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Code carried by `error` frames on the WebSocket.
    pub fn frame_code(&self) -> &'static str {
        match self {
            ServerError::Validation(_) => "validation",
            ServerError::NotFound(_) | ServerError::Integrity(_) => "not_found",
            ServerError::Forbidden(_) => "forbidden",
            ServerError::Conflict(_) => "conflict",
            ServerError::TransientIo(_) | ServerError::Internal(_) => "internal",
        }
    }

    /// Message safe to show a client; hides integrity and internal detail.
    pub fn public_message(&self) -> String {
        match self {
            ServerError::Integrity(_) => "Piece not found".to_string(),
            ServerError::TransientIo(_) => "Storage error".to_string(),
            ServerError::Internal(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ServerError::NotFound("Record not found".into()),
            StoreError::Conflict(msg) => ServerError::Conflict(msg),
            StoreError::Io(e) => ServerError::TransientIo(e.to_string()),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Validation(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFound(_) | ServerError::Integrity(_) => StatusCode::NOT_FOUND,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServerError::Conflict(_) => StatusCode::CONFLICT,
            ServerError::TransientIo(_) | ServerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = serde_json::json!({
            "error": self.public_message(),
        });

        (status, axum::Json(body)).into_response()
    }
}
