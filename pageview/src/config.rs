use ingest::config::IngestConfig;
use queue::config::QueueConfig;
use salt_store::config::SaltStoreConfig;
use serde::Deserialize;
use std::fs::File;
use worker::config::WorkerConfig;

fn default_log_level() -> String {
    "info".into()
}

fn default_statsd_port() -> u16 {
    8125
}

fn default_metrics_prefix() -> String {
    "pageview".into()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    #[serde(default = "default_statsd_port")]
    pub statsd_port: u16,
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    pub sentry_dsn: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            sentry_dsn: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub metrics: Option<MetricsConfig>,
    pub ingest: Option<IngestConfig>,
    pub worker: Option<WorkerConfig>,
    pub salt_store: Option<SaltStoreConfig>,
    pub queue: Option<QueueConfig>,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data: Config = serde_yaml::from_reader(file)?;
        data.validate()?;

        Ok(data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ingest) = &self.ingest {
            ingest.validate()?;
        }
        if let Some(worker) = &self.worker {
            worker.validate()?;
        }
        if let Some(metrics) = &self.metrics {
            if metrics.statsd_host.is_empty() {
                return Err(ConfigError::EmptyStatsdHost);
            }
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid ingest config: {0}")]
    Ingest(#[from] ingest::config::ValidationError),
    #[error("invalid worker config: {0}")]
    Worker(#[from] worker::config::ValidationError),
    #[error("metrics.statsd_host cannot be empty")]
    EmptyStatsdHost,
    #[error("missing config section: {0}")]
    MissingSection(&'static str),
}
