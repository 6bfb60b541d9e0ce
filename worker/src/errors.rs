use shared::event::SchemaError;
use thiserror::Error;

/// Errors that stop the worker from running
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(#[from] crate::config::ValidationError),

    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Why a message was rejected before it could join a batch.
///
/// Every variant ends with the message being nacked.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("payload is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("could not derive session signature: {0}")]
    Enrichment(#[from] salt_store::SaltStoreError),
}

impl ValidationError {
    /// Short label used when counting rejections.
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::Parse(_) => "parse",
            ValidationError::Schema(_) => "schema",
            ValidationError::Enrichment(_) => "enrichment",
        }
    }
}
