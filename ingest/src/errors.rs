use crate::auth::AuthError;
use crate::config::ValidationError;
use http::StatusCode;
use shared::event::SchemaError;
use thiserror::Error;

/// Errors that can occur while serving the ingest endpoint
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("Failed to read request body: {0}")]
    RequestBody(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Invalid event: {0}")]
    Schema(#[from] SchemaError),

    #[error("Authentication failed")]
    Unauthorized,

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("No route matched for request")]
    NotFound,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ValidationError),

    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IngestError {
    pub fn status(&self) -> StatusCode {
        match self {
            IngestError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            IngestError::RequestBody(_)
            | IngestError::InvalidEvent(_)
            | IngestError::Schema(_) => StatusCode::BAD_REQUEST,
            IngestError::Unauthorized => StatusCode::UNAUTHORIZED,
            IngestError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            IngestError::NotFound => StatusCode::NOT_FOUND,
            IngestError::Auth(_)
            | IngestError::Encode(_)
            | IngestError::Io(_)
            | IngestError::Config(_)
            | IngestError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
