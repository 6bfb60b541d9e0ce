//! Fakes injected through the `Sink` and `Subscription` seams.
use crate::sink::{Sink, SinkError};
use crate::transform::{ProcessedEvent, transform};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use queue::{AckId, MemoryQueue, Message, QueueError, Subscription};
use shared::event::RawEvent;
use std::sync::Arc;
use std::time::Duration;

pub fn raw_event(path: &str) -> RawEvent {
    RawEvent {
        site_id: "site".into(),
        hostname: "example.com".into(),
        pathname: path.into(),
        referrer: None,
        title: Some("Example".into()),
        screen_width: Some(1440),
        user_agent: "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0"
            .into(),
        client_ip: "203.0.113.9".into(),
        received_at: DateTime::parse_from_rfc3339("2024-05-17T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc),
    }
}

pub fn raw_payload(path: &str) -> Bytes {
    Bytes::from(serde_json::to_vec(&raw_event(path)).unwrap())
}

pub fn processed_event(path: &str) -> ProcessedEvent {
    transform(raw_event(path), "0".repeat(64))
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_for(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[derive(Clone, Copy)]
pub enum Behavior {
    Accept,
    Fail,
    /// Sleeps, then accepts
    Stall(Duration),
}

pub struct RecordingSink {
    calls: Mutex<Vec<Vec<ProcessedEvent>>>,
    /// Behavior per call, in order; `fallback` once these run out
    script: Vec<Behavior>,
    fallback: Behavior,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::with_behavior(Behavior::Accept)
    }

    pub fn failing() -> Self {
        Self::with_behavior(Behavior::Fail)
    }

    pub fn slow(delay: Duration) -> Self {
        Self::with_behavior(Behavior::Stall(delay))
    }

    /// The n-th call behaves as `script[n]`; later calls accept.
    pub fn scripted(script: Vec<Behavior>) -> Self {
        RecordingSink {
            calls: Mutex::new(Vec::new()),
            script,
            fallback: Behavior::Accept,
        }
    }

    fn with_behavior(behavior: Behavior) -> Self {
        RecordingSink {
            calls: Mutex::new(Vec::new()),
            script: Vec::new(),
            fallback: behavior,
        }
    }

    pub fn calls(&self) -> Vec<Vec<ProcessedEvent>> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn deliver(&self, _destination: &str, events: &[ProcessedEvent]) -> Result<(), SinkError> {
        let behavior = {
            let mut calls = self.calls.lock();
            let behavior = self.script.get(calls.len()).copied().unwrap_or(self.fallback);
            calls.push(events.to_vec());
            behavior
        };
        match behavior {
            Behavior::Accept => Ok(()),
            Behavior::Fail => Err(SinkError::Status(reqwest::StatusCode::SERVICE_UNAVAILABLE)),
            Behavior::Stall(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

/// Records every ack and nack before passing it on to a memory queue.
pub struct RecordingSubscription {
    inner: Arc<MemoryQueue>,
    acked: Mutex<Vec<AckId>>,
    nacked: Mutex<Vec<AckId>>,
}

impl RecordingSubscription {
    pub fn new(inner: Arc<MemoryQueue>) -> Self {
        RecordingSubscription {
            inner,
            acked: Mutex::new(Vec::new()),
            nacked: Mutex::new(Vec::new()),
        }
    }

    pub fn acked(&self) -> Vec<AckId> {
        self.acked.lock().clone()
    }

    pub fn nacked(&self) -> Vec<AckId> {
        self.nacked.lock().clone()
    }
}

#[async_trait]
impl Subscription for RecordingSubscription {
    async fn pull(&self, max_messages: usize) -> Result<Vec<Message>, QueueError> {
        self.inner.pull(max_messages).await
    }

    async fn ack(&self, ack_ids: &[AckId]) -> Result<(), QueueError> {
        self.acked.lock().extend_from_slice(ack_ids);
        self.inner.ack(ack_ids).await
    }

    async fn nack(&self, ack_ids: &[AckId]) -> Result<(), QueueError> {
        self.nacked.lock().extend_from_slice(ack_ids);
        self.inner.nack(ack_ids).await
    }
}
