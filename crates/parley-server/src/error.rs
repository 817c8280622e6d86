use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use parley_shared::error::TokenError;
use parley_shared::protocol::ProtocolViolation;
use parley_store::RegistryError;
use thiserror::Error;
use uuid::Uuid;

use crate::credentials::CredentialError;
use crate::hub::ConnectionId;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("File not found: {0}")]
    FileNotFound(Uuid),

    #[error("File not found on disk: {0}")]
    FileMissing(Uuid),

    #[error("File too large (max {max} bytes)")]
    FileTooLarge { max: usize },

    #[error("Insufficient storage")]
    StorageFull,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::FileNotFound(_) => (StatusCode::NOT_FOUND, "File not found".to_string()),
            ServerError::FileMissing(_) => {
                (StatusCode::NOT_FOUND, "File not found on disk".to_string())
            }
            ServerError::FileTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            ServerError::StorageFull => (StatusCode::INSUFFICIENT_STORAGE, self.to_string()),
            ServerError::Storage(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error".to_string())
            }
            ServerError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<RegistryError> for ServerError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => ServerError::FileNotFound(id),
            RegistryError::Missing(id) => ServerError::FileMissing(id),
            RegistryError::TooLarge { max } => ServerError::FileTooLarge { max },
            RegistryError::StorageFull => ServerError::StorageFull,
            RegistryError::EmptyUpload => ServerError::BadRequest("Empty file".to_string()),
            RegistryError::Io(e) => ServerError::Storage(e.to_string()),
            RegistryError::Snapshot(e) => ServerError::Storage(e.to_string()),
        }
    }
}

impl From<TokenError> for ServerError {
    fn from(e: TokenError) -> Self {
        ServerError::Unauthorized(e.to_string())
    }
}

impl From<CredentialError> for ServerError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::InvalidCredentials => {
                ServerError::Unauthorized("Invalid credentials".to_string())
            }
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl From<HubError> for ServerError {
    fn from(e: HubError) -> Self {
        match e {
            HubError::MissingToken => ServerError::Unauthorized(e.to_string()),
            HubError::Auth(token) => token.into(),
            HubError::FileNotFound(id) => ServerError::FileNotFound(id),
            other => ServerError::BadRequest(other.to_string()),
        }
    }
}

/// Errors from broadcast hub operations. None of them abort the hub itself;
/// at most they close the one connection involved.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Missing session token")]
    MissingToken,

    #[error("Admission refused: {0}")]
    Auth(#[from] TokenError),

    #[error("Empty message dropped")]
    EmptyMessage,

    #[error("File not found: {0}")]
    FileNotFound(Uuid),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("Connection {0} closed after repeated protocol violations")]
    TooManyViolations(ConnectionId),

    #[error("Connection {0} is not active")]
    NotActive(ConnectionId),
}
