use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use courier_shared::ValidationError;
use courier_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Rejected before anything was persisted.
    #[error("Invalid message: {0}")]
    Validation(#[from] ValidationError),

    /// The store failed; the operation had no effect.
    #[error("Persistence error: {0}")]
    Persistence(StoreError),

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Blob too large: {size} bytes (max {max})")]
    BlobTooLarge { size: usize, max: usize },

    #[error("Blob storage error: {0}")]
    BlobStorage(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Missing or invalid user identity")]
    Unauthorized,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(v) => ServerError::Validation(v),
            StoreError::UnknownAttachment(hash) => {
                ServerError::BadRequest(format!("Unknown attachment: {hash}"))
            }
            StoreError::NotFound => ServerError::NotFound("Record not found".into()),
            other => ServerError::Persistence(other),
        }
    }
}

impl ServerError {
    /// Status code and the message safe to show a client.
    pub fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            ServerError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, self.to_string()),
            ServerError::Persistence(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Persistence error".to_string())
            }
            ServerError::BlobNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::BlobTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, self.to_string())
            }
            ServerError::BlobStorage(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Blob storage error".to_string())
            }
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
