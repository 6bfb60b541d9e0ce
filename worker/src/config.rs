use serde::Deserialize;
use shared::http::{InvalidPort, Listener};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error(transparent)]
    InvalidPort(#[from] InvalidPort),

    #[error("max_batch_size must be at least 1")]
    ZeroBatchSize,

    #[error("flush_interval_ms must be at least 1")]
    ZeroFlushInterval,

    #[error("max_inflight_flushes must be at least 1")]
    ZeroInflightFlushes,

    #[error("pull_max_messages must be at least 1")]
    ZeroPullSize,

    #[error("salt_cleanup_interval_secs must be at least 1 when set")]
    ZeroCleanupInterval,

    #[error("Empty sink destination")]
    EmptyDestination,

    #[error("sink timeout_ms must be at least 1")]
    ZeroSinkTimeout,
}

fn default_max_batch_size() -> usize {
    100
}

fn default_flush_interval_ms() -> u64 {
    5_000
}

fn default_max_inflight_flushes() -> usize {
    2
}

fn default_pull_max_messages() -> usize {
    100
}

fn default_sink_timeout_ms() -> u64 {
    10_000
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Serves /health and /ready when set
    pub admin_listener: Option<Listener>,
    pub sink: SinkConfig,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Maximum age of the oldest buffered event before the batch is flushed
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Batches that may be in delivery at the same time
    #[serde(default = "default_max_inflight_flushes")]
    pub max_inflight_flushes: usize,
    #[serde(default = "default_pull_max_messages")]
    pub pull_max_messages: usize,
    /// Runs the expired salt sweep on this interval when set
    #[serde(default)]
    pub salt_cleanup_interval_secs: Option<u64>,
    /// Keep pulling after shutdown until the subscription has nothing ready.
    /// Needed when the queue does not outlive the process.
    #[serde(default)]
    pub drain_on_shutdown: bool,
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(listener) = &self.admin_listener {
            listener.validate()?;
        }
        self.sink.validate()?;

        if self.max_batch_size == 0 {
            return Err(ValidationError::ZeroBatchSize);
        }
        if self.flush_interval_ms == 0 {
            return Err(ValidationError::ZeroFlushInterval);
        }
        if self.max_inflight_flushes == 0 {
            return Err(ValidationError::ZeroInflightFlushes);
        }
        if self.pull_max_messages == 0 {
            return Err(ValidationError::ZeroPullSize);
        }
        if self.salt_cleanup_interval_secs == Some(0) {
            return Err(ValidationError::ZeroCleanupInterval);
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SinkConfig {
    pub base_url: Url,
    /// Name of the data source batches are written to
    pub destination: String,
    pub auth_token: Option<String>,
    #[serde(default = "default_sink_timeout_ms")]
    pub timeout_ms: u64,
}

impl SinkConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.destination.is_empty() {
            return Err(ValidationError::EmptyDestination);
        }
        if self.timeout_ms == 0 {
            return Err(ValidationError::ZeroSinkTimeout);
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
