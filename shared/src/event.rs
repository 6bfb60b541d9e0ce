use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_SITE_ID_LEN: usize = 128;
const MAX_HOSTNAME_LEN: usize = 253;
const MAX_URL_LEN: usize = 2048;
const MAX_TITLE_LEN: usize = 1024;

/// A field of a `RawEvent` that breaks the event schema.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("missing or empty field: {0}")]
    MissingField(&'static str),

    #[error("field {field} is too long ({len} bytes)")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("pathname must start with '/'")]
    InvalidPathname,
}

/// A page hit as accepted at ingress, before any enrichment.
///
/// The client supplied part comes from the request body; `user_agent`,
/// `client_ip` and `received_at` are captured by the ingest service. This is
/// the payload carried on the queue between ingest and the batch worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub site_id: String,
    pub hostname: String,
    pub pathname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_width: Option<u32>,
    pub user_agent: String,
    pub client_ip: String,
    pub received_at: DateTime<Utc>,
}

impl RawEvent {
    /// Checks the event against the schema the worker enforces. Ingest runs
    /// the same check so a rejected event never reaches the queue.
    pub fn validate(&self) -> Result<(), SchemaError> {
        check_field("site_id", &self.site_id, MAX_SITE_ID_LEN)?;
        check_field("hostname", &self.hostname, MAX_HOSTNAME_LEN)?;
        check_field("pathname", &self.pathname, MAX_URL_LEN)?;
        check_field("client_ip", &self.client_ip, MAX_HOSTNAME_LEN)?;

        if !self.pathname.starts_with('/') {
            return Err(SchemaError::InvalidPathname);
        }
        if let Some(referrer) = &self.referrer {
            check_len("referrer", referrer, MAX_URL_LEN)?;
        }
        if let Some(title) = &self.title {
            check_len("title", title, MAX_TITLE_LEN)?;
        }
        Ok(())
    }
}

fn check_field(field: &'static str, value: &str, max_len: usize) -> Result<(), SchemaError> {
    if value.trim().is_empty() {
        return Err(SchemaError::MissingField(field));
    }
    check_len(field, value, max_len)
}

fn check_len(field: &'static str, value: &str, max_len: usize) -> Result<(), SchemaError> {
    if value.len() > max_len {
        return Err(SchemaError::FieldTooLong {
            field,
            len: value.len(),
        });
    }
    Ok(())
}
