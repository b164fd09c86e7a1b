use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use jive_shared::ProtocolError;
use jive_store::StoreError;
use thiserror::Error;

/// Failures of a chat operation, reported back to the originating
/// connection only.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Not allowed: {0}")]
    Authorization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ChatError {
    /// Short label sent as the `message` of an error event.
    pub fn label(&self) -> &'static str {
        match self {
            ChatError::Authorization(_) => "Unauthorized",
            ChatError::NotFound(_) => "Not found",
            ChatError::Validation(_) => "Invalid request",
            ChatError::Storage(_) => "Internal error",
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ChatError::NotFound("record not found".into()),
            other => ChatError::Storage(other.to_string()),
        }
    }
}

impl From<ProtocolError> for ChatError {
    fn from(e: ProtocolError) -> Self {
        ChatError::Validation(e.to_string())
    }
}

/// HTTP-facing errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
