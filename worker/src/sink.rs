use crate::config::SinkConfig;
use crate::transform::ProcessedEvent;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sink returned {0}")]
    Status(reqwest::StatusCode),

    #[error("sink did not answer within {0:?}")]
    Timeout(Duration),

    #[error("could not encode batch: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid sink URL: {0}")]
    InvalidUrl(String),
}

/// Destination for flushed batches.
///
/// A batch is accepted or rejected as a whole. Any error means none of the
/// events may be considered delivered.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, destination: &str, events: &[ProcessedEvent]) -> Result<(), SinkError>;
}

/// Posts batches as newline delimited JSON to `{base_url}/v0/events?name={destination}`.
pub struct HttpSink {
    client: reqwest::Client,
    events_url: Url,
    auth_token: Option<String>,
}

impl HttpSink {
    pub fn new(config: &SinkConfig) -> Result<Self, SinkError> {
        let mut events_url = config.base_url.clone();
        events_url
            .path_segments_mut()
            .map_err(|_| SinkError::InvalidUrl(config.base_url.to_string()))?
            .pop_if_empty()
            .extend(["v0", "events"]);

        Ok(HttpSink {
            client: reqwest::Client::new(),
            events_url,
            auth_token: config.auth_token.clone(),
        })
    }
}

fn encode_ndjson(events: &[ProcessedEvent]) -> Result<Vec<u8>, serde_json::Error> {
    let mut body = Vec::new();
    for event in events {
        serde_json::to_writer(&mut body, event)?;
        body.push(b'\n');
    }
    Ok(body)
}

#[async_trait]
impl Sink for HttpSink {
    async fn deliver(&self, destination: &str, events: &[ProcessedEvent]) -> Result<(), SinkError> {
        let body = encode_ndjson(events)?;

        let mut request = self
            .client
            .post(self.events_url.clone())
            .query(&[("name", destination)])
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(SinkError::Status(response.status()));
        }
        Ok(())
    }
}
