//! Pulls raw events, enriches them, and delivers them to the sink in batches.
//!
//! Two tasks cooperate over a bounded channel:
//!
//! - The puller takes messages from the subscription, decodes and enriches
//!   them, and nacks anything it cannot accept. Accepted events go into the
//!   channel together with their ack ids.
//! - The batcher owns the `PendingBatch`. Receiving an event, checking the size
//!   trigger and the age trigger all happen in its single `select!` loop, so two
//!   flushes can never pick up the same members.
//!
//! Each flush runs in its own task and settles exactly the members it was
//! given: all acked if the sink accepted the batch, all nacked otherwise.
use crate::batch::PendingBatch;
use crate::config::WorkerConfig;
use crate::errors::ValidationError;
use crate::metrics_defs::{
    BATCH_FLUSHED, BATCH_SIZE, FLUSHES_INFLIGHT, MESSAGES_RECEIVED, MESSAGES_REJECTED,
    QUEUE_ERRORS, SINK_DURATION,
};
use crate::session::SessionSignatureGenerator;
use crate::sink::{Sink, SinkError};
use crate::transform::{ProcessedEvent, parse_event, transform};
use queue::{AckId, Message, Subscription};
use shared::{counter, gauge, histogram};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const PULL_ERROR_BACKOFF: Duration = Duration::from_secs(1);
/// A drain pull that finds nothing within this window ends the drain.
const DRAIN_PULL_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct BatchSettings {
    pub max_batch_size: usize,
    pub flush_interval: Duration,
    pub max_inflight_flushes: usize,
    pub pull_max_messages: usize,
    pub destination: String,
    pub sink_timeout: Duration,
    /// Keep pulling after shutdown until the subscription has nothing ready
    pub drain_on_shutdown: bool,
}

impl BatchSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        BatchSettings {
            max_batch_size: config.max_batch_size,
            flush_interval: config.flush_interval(),
            max_inflight_flushes: config.max_inflight_flushes,
            pull_max_messages: config.pull_max_messages,
            destination: config.sink.destination.clone(),
            sink_timeout: config.sink.timeout(),
            drain_on_shutdown: config.drain_on_shutdown,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum FlushTrigger {
    Size,
    Age,
    Shutdown,
}

impl FlushTrigger {
    fn as_str(self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Age => "age",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

pub struct BatchWorker {
    subscription: Arc<dyn Subscription>,
    sink: Arc<dyn Sink>,
    generator: SessionSignatureGenerator,
    settings: Arc<BatchSettings>,
}

impl BatchWorker {
    pub fn new(
        subscription: Arc<dyn Subscription>,
        sink: Arc<dyn Sink>,
        generator: SessionSignatureGenerator,
        settings: BatchSettings,
    ) -> Self {
        BatchWorker {
            subscription,
            sink,
            generator,
            settings: Arc::new(settings),
        }
    }

    /// Runs until `shutdown` is cancelled. Everything already pulled at that
    /// point is still batched and flushed, and this returns only after every
    /// flush has been settled. With `drain_on_shutdown` the subscription is
    /// emptied first.
    pub async fn run(self, shutdown: CancellationToken) {
        let (sender, receiver) = mpsc::channel(self.settings.pull_max_messages);

        let puller = tokio::spawn(pull_loop(
            self.subscription.clone(),
            self.generator,
            self.settings.pull_max_messages,
            self.settings.drain_on_shutdown,
            sender,
            shutdown,
        ));

        let batcher = Batcher {
            batch: PendingBatch::new(self.settings.max_batch_size),
            subscription: self.subscription,
            sink: self.sink,
            settings: self.settings,
            flushes: JoinSet::new(),
        };
        // Ends once the puller has stopped and the channel is drained
        batcher.run(receiver).await;

        if let Err(e) = puller.await {
            tracing::error!(error = %e, "Puller task failed");
        }
        tracing::info!("Batch worker stopped");
    }
}

async fn pull_loop(
    subscription: Arc<dyn Subscription>,
    generator: SessionSignatureGenerator,
    max_messages: usize,
    drain: bool,
    sender: mpsc::Sender<(ProcessedEvent, AckId)>,
    shutdown: CancellationToken,
) {
    while let Some(messages) =
        next_pull(subscription.as_ref(), max_messages, drain, &shutdown).await
    {
        counter!(MESSAGES_RECEIVED).increment(messages.len() as u64);

        let mut rejected = Vec::new();
        for message in messages {
            match accept(&generator, &message).await {
                Ok(event) => {
                    if sender.send((event, message.ack_id)).await.is_err() {
                        // The batcher only goes away after this task has ended
                        tracing::error!("Batcher stopped before the puller");
                        return;
                    }
                }
                Err(e) => {
                    counter!(MESSAGES_REJECTED, "reason" => e.reason()).increment(1);
                    tracing::warn!(ack_id = %message.ack_id, error = %e, "Rejecting message");
                    rejected.push(message.ack_id);
                }
            }
        }

        if rejected.is_empty() {
            continue;
        }
        if let Err(e) = subscription.nack(&rejected).await {
            counter!(QUEUE_ERRORS, "operation" => "nack").increment(1);
            tracing::error!(error = %e, count = rejected.len(), "Failed to nack rejected messages");
        }
    }

    tracing::info!("Stopped pulling messages");
}

/// Waits for the next non-empty pull. Returns `None` once pulling should stop:
/// right at shutdown, or when draining, at the first pull that comes back empty.
async fn next_pull(
    subscription: &dyn Subscription,
    max_messages: usize,
    drain: bool,
    shutdown: &CancellationToken,
) -> Option<Vec<Message>> {
    loop {
        if shutdown.is_cancelled() {
            if !drain {
                return None;
            }
            return match tokio::time::timeout(DRAIN_PULL_TIMEOUT, subscription.pull(max_messages))
                .await
            {
                Ok(Ok(messages)) if !messages.is_empty() => Some(messages),
                Ok(Err(e)) => {
                    counter!(QUEUE_ERRORS, "operation" => "pull").increment(1);
                    tracing::error!(error = %e, "Failed to pull messages while draining");
                    None
                }
                _ => None,
            };
        }

        tokio::select! {
            _ = shutdown.cancelled() => {}
            result = subscription.pull(max_messages) => match result {
                Ok(messages) if !messages.is_empty() => return Some(messages),
                Ok(_) => {}
                Err(e) => {
                    counter!(QUEUE_ERRORS, "operation" => "pull").increment(1);
                    tracing::error!(error = %e, "Failed to pull messages");
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(PULL_ERROR_BACKOFF) => {}
                    }
                }
            },
        }
    }
}

/// Decodes, validates and enriches one message.
///
/// The salt is chosen by the day the event was received, so a redelivered
/// event keeps its session signature.
async fn accept(
    generator: &SessionSignatureGenerator,
    message: &Message,
) -> Result<ProcessedEvent, ValidationError> {
    let raw = parse_event(&message.data)?;
    let session_id = generator
        .generate_at(
            &raw.site_id,
            &raw.client_ip,
            &raw.user_agent,
            raw.received_at,
        )
        .await?;
    Ok(transform(raw, session_id))
}

struct Batcher {
    batch: PendingBatch,
    subscription: Arc<dyn Subscription>,
    sink: Arc<dyn Sink>,
    settings: Arc<BatchSettings>,
    flushes: JoinSet<()>,
}

impl Batcher {
    async fn run(mut self, mut receiver: mpsc::Receiver<(ProcessedEvent, AckId)>) {
        loop {
            let deadline = self.batch.deadline(self.settings.flush_interval);
            let flush_at = deadline.unwrap_or_else(|| Instant::now() + self.settings.flush_interval);

            tokio::select! {
                received = receiver.recv() => match received {
                    Some((event, ack_id)) => {
                        if self.batch.push(event, ack_id) {
                            self.flush(FlushTrigger::Size).await;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(flush_at), if deadline.is_some() => {
                    self.flush(FlushTrigger::Age).await;
                }
                Some(result) = self.flushes.join_next(), if !self.flushes.is_empty() => {
                    self.settled(result);
                }
            }
        }

        if !self.batch.is_empty() {
            self.flush(FlushTrigger::Shutdown).await;
        }
        while let Some(result) = self.flushes.join_next().await {
            self.settled(result);
        }
    }

    async fn flush(&mut self, trigger: FlushTrigger) {
        while self.flushes.len() >= self.settings.max_inflight_flushes {
            match self.flushes.join_next().await {
                Some(result) => self.settled(result),
                None => break,
            }
        }

        let members = self.batch.take();
        counter!(BATCH_FLUSHED, "trigger" => trigger.as_str()).increment(1);
        histogram!(BATCH_SIZE).record(members.len() as f64);
        tracing::debug!(
            trigger = trigger.as_str(),
            events = members.len(),
            "Flushing batch"
        );

        self.flushes.spawn(deliver(
            self.subscription.clone(),
            self.sink.clone(),
            self.settings.clone(),
            members,
        ));
        gauge!(FLUSHES_INFLIGHT).set(self.flushes.len() as f64);
    }

    fn settled(&self, result: Result<(), JoinError>) {
        if let Err(e) = result {
            tracing::error!(error = %e, "Flush task failed");
        }
        gauge!(FLUSHES_INFLIGHT).set(self.flushes.len() as f64);
    }
}

async fn deliver(
    subscription: Arc<dyn Subscription>,
    sink: Arc<dyn Sink>,
    settings: Arc<BatchSettings>,
    members: Vec<(ProcessedEvent, AckId)>,
) {
    let (events, ack_ids): (Vec<ProcessedEvent>, Vec<AckId>) = members.into_iter().unzip();

    let started = Instant::now();
    let result = match tokio::time::timeout(
        settings.sink_timeout,
        sink.deliver(&settings.destination, &events),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(SinkError::Timeout(settings.sink_timeout)),
    };
    let outcome = if result.is_ok() { "success" } else { "failure" };
    histogram!(SINK_DURATION, "outcome" => outcome).record(started.elapsed().as_secs_f64());

    match result {
        Ok(()) => {
            tracing::debug!(events = ack_ids.len(), "Delivered batch");
            if let Err(e) = subscription.ack(&ack_ids).await {
                counter!(QUEUE_ERRORS, "operation" => "ack").increment(1);
                tracing::error!(error = %e, events = ack_ids.len(), "Failed to ack delivered batch");
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, events = ack_ids.len(), "Batch delivery failed, nacking");
            if let Err(e) = subscription.nack(&ack_ids).await {
                counter!(QUEUE_ERRORS, "operation" => "nack").increment(1);
                tracing::error!(error = %e, events = ack_ids.len(), "Failed to nack batch");
            }
        }
    }
}
