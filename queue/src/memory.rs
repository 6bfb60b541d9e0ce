use crate::{AckId, Message, Publisher, QueueError, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// How long a nacked message waits before it can be pulled again.
pub const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_millis(500);

#[derive(Default)]
struct State {
    ready: VecDeque<Bytes>,
    /// Nacked payloads with the instant they become ready again, oldest first
    delayed: VecDeque<(Instant, Bytes)>,
    leased: HashMap<AckId, Bytes>,
    deliveries: u64,
}

/// In-process queue with lease semantics.
///
/// Pulled messages are leased until they are acked or nacked. A nacked payload
/// is held back for the redelivery delay, then goes to the front of the queue
/// and the next pull delivers it again under a new ack id. Nothing is
/// persisted.
pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
    redelivery_delay: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::with_redelivery_delay(DEFAULT_REDELIVERY_DELAY)
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_redelivery_delay(redelivery_delay: Duration) -> Self {
        MemoryQueue {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            redelivery_delay,
        }
    }

    /// Messages waiting to be pulled, including nacked ones still held back.
    pub fn ready_len(&self) -> usize {
        let state = self.state.lock();
        state.ready.len() + state.delayed.len()
    }

    /// Messages pulled but not yet settled.
    pub fn leased_len(&self) -> usize {
        self.state.lock().leased.len()
    }

    /// Takes up to `max_messages`, or returns the instant the next held back
    /// message becomes ready when there is nothing to take yet.
    fn try_take(&self, max_messages: usize) -> Result<Vec<Message>, Option<Instant>> {
        let mut state = self.state.lock();

        let now = Instant::now();
        let mut due = Vec::new();
        while state.delayed.front().is_some_and(|(at, _)| *at <= now) {
            if let Some((_, data)) = state.delayed.pop_front() {
                due.push(data);
            }
        }
        for data in due.into_iter().rev() {
            state.ready.push_front(data);
        }

        if state.ready.is_empty() {
            return Err(state.delayed.front().map(|(at, _)| *at));
        }

        let count = max_messages.min(state.ready.len());
        let mut messages = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(data) = state.ready.pop_front() else {
                break;
            };
            state.deliveries += 1;
            let ack_id = format!("memory-{}", state.deliveries);
            state.leased.insert(ack_id.clone(), data.clone());
            messages.push(Message { ack_id, data });
        }
        Ok(messages)
    }
}

#[async_trait]
impl Publisher for MemoryQueue {
    async fn publish(&self, data: Bytes) -> Result<(), QueueError> {
        self.state.lock().ready.push_back(data);
        self.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl Subscription for MemoryQueue {
    async fn pull(&self, max_messages: usize) -> Result<Vec<Message>, QueueError> {
        tokio::task::yield_now().await;
        loop {
            match self.try_take(max_messages) {
                Ok(messages) => return Ok(messages),
                // A publish between the check and this await leaves a permit behind
                Err(None) => self.notify.notified().await,
                Err(Some(next_ready)) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(next_ready) => {}
                    }
                }
            }
        }
    }

    async fn ack(&self, ack_ids: &[AckId]) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        for ack_id in ack_ids {
            if state.leased.remove(ack_id).is_none() {
                tracing::warn!(ack_id = %ack_id, "Ack for unknown or settled message");
            }
        }
        Ok(())
    }

    async fn nack(&self, ack_ids: &[AckId]) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            let ready_at = Instant::now() + self.redelivery_delay;
            for ack_id in ack_ids {
                match state.leased.remove(ack_id) {
                    Some(data) => state.delayed.push_back((ready_at, data)),
                    None => tracing::warn!(ack_id = %ack_id, "Nack for unknown or settled message"),
                }
            }
        }
        // Wakes a waiting puller so it starts timing the delay
        self.notify.notify_one();
        Ok(())
    }
}
