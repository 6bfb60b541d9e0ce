use crate::transform::ProcessedEvent;
use queue::AckId;
use std::time::Duration;
use tokio::time::Instant;

/// Events waiting to be flushed, each paired with the ack id of the message it
/// came from.
///
/// Owned by the batcher task alone. `take` hands the whole content to a flush
/// and leaves an empty batch behind, so one member is never part of two
/// flushes.
pub struct PendingBatch {
    members: Vec<(ProcessedEvent, AckId)>,
    first_accepted_at: Option<Instant>,
    max_size: usize,
}

impl PendingBatch {
    pub fn new(max_size: usize) -> Self {
        PendingBatch {
            members: Vec::with_capacity(max_size),
            first_accepted_at: None,
            max_size,
        }
    }

    /// Appends a member and reports whether the batch is now full.
    pub fn push(&mut self, event: ProcessedEvent, ack_id: AckId) -> bool {
        if self.members.is_empty() {
            self.first_accepted_at = Some(Instant::now());
        }
        self.members.push((event, ack_id));
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.max_size
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// When the batch becomes due for an age-triggered flush, if it has members.
    pub fn deadline(&self, flush_interval: Duration) -> Option<Instant> {
        self.first_accepted_at.map(|at| at + flush_interval)
    }

    pub fn take(&mut self) -> Vec<(ProcessedEvent, AckId)> {
        self.first_accepted_at = None;
        std::mem::replace(&mut self.members, Vec::with_capacity(self.max_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::transform;
    use chrono::Utc;
    use shared::event::RawEvent;

    fn event(path: &str) -> ProcessedEvent {
        let raw = RawEvent {
            site_id: "site".into(),
            hostname: "example.com".into(),
            pathname: path.into(),
            referrer: None,
            title: None,
            screen_width: None,
            user_agent: String::new(),
            client_ip: "127.0.0.1".into(),
            received_at: Utc::now(),
        };
        transform(raw, "session".into())
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_and_take() {
        let mut batch = PendingBatch::new(2);
        assert!(batch.is_empty());
        assert_eq!(batch.deadline(Duration::from_secs(1)), None);

        let started = Instant::now();
        assert!(!batch.push(event("/a"), "1".into()));
        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(batch.push(event("/b"), "2".into()));

        // The deadline follows the oldest member
        assert_eq!(
            batch.deadline(Duration::from_secs(1)),
            Some(started + Duration::from_secs(1))
        );

        let members = batch.take();
        let ack_ids: Vec<_> = members.iter().map(|(_, id)| id.as_str()).collect();
        assert_eq!(ack_ids, vec!["1", "2"]);
        assert!(batch.is_empty());
        assert_eq!(batch.deadline(Duration::from_secs(1)), None);
    }
}
