use serde::Deserialize;
use shared::http::{InvalidPort, Listener};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error(transparent)]
    InvalidPort(#[from] InvalidPort),

    #[error("Path must start with '/': {0}")]
    InvalidPath(String),

    #[error("Event path and loopback path must differ")]
    DuplicatePath,

    #[error("max_body_bytes must be at least 1")]
    ZeroMaxBodyBytes,

    #[error("Empty auth secret; omit it to disable authentication")]
    EmptySecret,
}

fn default_event_path() -> String {
    "/api/event".to_string()
}

fn default_max_body_bytes() -> usize {
    16 * 1024
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct IngestConfig {
    /// Main listener for incoming events
    pub listener: Listener,
    /// Serves /health and /ready when set
    pub admin_listener: Option<Listener>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default = "default_event_path")]
    pub event_path: String,
    /// Take the client IP from the first `X-Forwarded-For` entry. Only enable
    /// behind a proxy that sets the header.
    #[serde(default)]
    pub trust_forwarded_for: bool,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl IngestConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        if let Some(admin_listener) = &self.admin_listener {
            admin_listener.validate()?;
        }

        validate_path(&self.event_path)?;
        if let Some(loopback_path) = &self.auth.loopback_path {
            validate_path(loopback_path)?;
            if *loopback_path == self.event_path {
                return Err(ValidationError::DuplicatePath);
            }
        }

        if self.max_body_bytes == 0 {
            return Err(ValidationError::ZeroMaxBodyBytes);
        }
        if self.auth.secret.as_deref() == Some("") {
            return Err(ValidationError::EmptySecret);
        }
        Ok(())
    }
}

fn validate_path(path: &str) -> Result<(), ValidationError> {
    if !path.starts_with('/') {
        return Err(ValidationError::InvalidPath(path.to_string()));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Reject requests that fail authentication
    #[default]
    Enforce,
    /// Log and count failures but let the request through
    LogOnly,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct AuthConfig {
    /// Shared secret for request signatures. Authentication is disabled when
    /// absent.
    pub secret: Option<String>,
    #[serde(default)]
    pub mode: AuthMode,
    /// Event endpoint for trusted internal senders, exempt from authentication
    pub loopback_path: Option<String>,
}
