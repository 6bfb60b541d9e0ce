//! The durable queue between the ingest service and the batch worker.
//!
//! Ingest publishes opaque payloads; the worker pulls them through a
//! subscription and settles each one with `ack` (remove permanently) or `nack`
//! (ask the backend to redeliver). Redelivery policy belongs to the backend.
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

pub mod config;
mod memory;
mod pubsub;

pub use memory::MemoryQueue;
pub use pubsub::{PubSubPublisher, PubSubSubscription};

use config::QueueConfig;

/// Opaque handle used to settle one delivery of a message.
pub type AckId = String;

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub ack_id: AckId,
    pub data: Bytes,
}

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("queue request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("queue returned {0}")]
    UnexpectedStatus(reqwest::StatusCode),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, data: Bytes) -> Result<(), QueueError>;
}

#[async_trait]
pub trait Subscription: Send + Sync {
    /// Waits for and returns up to `max_messages` messages. May return an
    /// empty list when the backend has nothing to deliver.
    async fn pull(&self, max_messages: usize) -> Result<Vec<Message>, QueueError>;

    async fn ack(&self, ack_ids: &[AckId]) -> Result<(), QueueError>;

    async fn nack(&self, ack_ids: &[AckId]) -> Result<(), QueueError>;
}

/// Publisher and subscription handles built from one queue configuration.
/// Either side may be absent when the configuration only names one end.
pub struct Queue {
    pub publisher: Option<Arc<dyn Publisher>>,
    pub subscription: Option<Arc<dyn Subscription>>,
}

pub fn connect(config: &QueueConfig) -> Result<Queue, QueueError> {
    match config {
        QueueConfig::Memory => {
            let queue = Arc::new(MemoryQueue::new());
            Ok(Queue {
                publisher: Some(queue.clone()),
                subscription: Some(queue),
            })
        }
        QueueConfig::PubSub(pubsub_config) => {
            let publisher = match &pubsub_config.topic {
                Some(topic) => Some(Arc::new(PubSubPublisher::new(pubsub_config, topic)?)
                    as Arc<dyn Publisher>),
                None => None,
            };
            let subscription = match &pubsub_config.subscription {
                Some(subscription) => Some(Arc::new(PubSubSubscription::new(
                    pubsub_config,
                    subscription,
                )?) as Arc<dyn Subscription>),
                None => None,
            };

            Ok(Queue {
                publisher,
                subscription,
            })
        }
    }
}
