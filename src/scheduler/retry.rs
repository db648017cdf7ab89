//! Failed-publication retry queue
//!
//! Holds (task, bot) pairs whose publication failed with a retryable error.
//! A pair is queued at most once; a repeated failure bumps its attempt
//! count. The sweep drains the queue and re-runs each pair.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::metrics;
use crate::models::{BotId, TaskId};

/// A queued retry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryEntry {
    pub task_id: TaskId,
    pub bot_id: BotId,
    /// First failure of the current streak
    pub first_failed_at: DateTime<Utc>,
    /// Failures so far, including the one that queued it
    pub attempts: u32,
}

/// What [`RetryQueue::enqueue`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Already waiting; attempt count bumped
    AlreadyQueued,
    /// Attempt cap reached, dropped for good
    DeadLettered,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<(TaskId, BotId), RetryEntry>,
    /// Attempt counts of drained entries awaiting their retry result
    in_flight: HashMap<(TaskId, BotId), RetryEntry>,
}

/// Set-semantics retry queue
#[derive(Debug, Default)]
pub struct RetryQueue {
    state: Mutex<QueueState>,
    /// `None` retries forever
    max_attempts: Option<u32>,
}

impl RetryQueue {
    pub fn new(max_attempts: Option<u32>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            max_attempts,
        }
    }

    /// Record a failed publication of `task_id` by `bot_id`
    pub async fn enqueue(&self, task_id: TaskId, bot_id: BotId, now: DateTime<Utc>) -> EnqueueOutcome {
        let key = (task_id, bot_id);
        let mut state = self.state.lock().await;

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.attempts += 1;
            return EnqueueOutcome::AlreadyQueued;
        }

        let entry = match state.in_flight.remove(&key) {
            Some(mut prev) => {
                prev.attempts += 1;
                prev
            }
            None => RetryEntry {
                task_id,
                bot_id,
                first_failed_at: now,
                attempts: 1,
            },
        };

        if self.max_attempts.is_some_and(|max| entry.attempts > max) {
            tracing::error!(
                task_id,
                bot_id,
                attempts = entry.attempts,
                since = %entry.first_failed_at,
                "Publication abandoned after repeated failures"
            );
            metrics::record_dead_letter();
            metrics::set_retry_queue_size(state.entries.len());
            return EnqueueOutcome::DeadLettered;
        }

        tracing::info!(task_id, bot_id, attempts = entry.attempts, "Queued for retry");
        state.entries.insert(key, entry);
        metrics::set_retry_queue_size(state.entries.len());
        EnqueueOutcome::Queued
    }

    /// Take every queued entry, ordered by task id.
    ///
    /// Drained entries remember their attempt count until [`Self::complete`]
    /// or a new [`Self::enqueue`] for the same pair.
    pub async fn drain(&self) -> Vec<RetryEntry> {
        let mut state = self.state.lock().await;
        let mut drained: Vec<RetryEntry> = state.entries.drain().map(|(_, e)| e).collect();
        drained.sort_by_key(|e| (e.task_id, e.bot_id));
        for e in &drained {
            state.in_flight.insert((e.task_id, e.bot_id), e.clone());
        }
        metrics::set_retry_queue_size(0);
        drained
    }

    /// Forget `task_id`/`bot_id` after a successful publication
    pub async fn complete(&self, task_id: TaskId, bot_id: BotId) -> bool {
        let key = (task_id, bot_id);
        let mut state = self.state.lock().await;
        let queued = state.entries.remove(&key).is_some();
        let in_flight = state.in_flight.remove(&key).is_some();
        metrics::set_retry_queue_size(state.entries.len());
        queued || in_flight
    }

    pub async fn contains(&self, task_id: TaskId, bot_id: BotId) -> bool {
        self.state.lock().await.entries.contains_key(&(task_id, bot_id))
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    /// Snapshot of the queued entries, ordered by task id
    pub async fn entries(&self) -> Vec<RetryEntry> {
        let state = self.state.lock().await;
        let mut entries: Vec<RetryEntry> = state.entries.values().cloned().collect();
        entries.sort_by_key(|e| (e.task_id, e.bot_id));
        entries
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_semantics() {
        let q = RetryQueue::default();
        let now = Utc::now();
        assert_eq!(q.enqueue(1, 10, now).await, EnqueueOutcome::Queued);
        assert_eq!(q.enqueue(1, 10, now).await, EnqueueOutcome::AlreadyQueued);
        assert_eq!(q.len().await, 1);
        assert_eq!(q.entries().await[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_drain_and_complete() {
        let q = RetryQueue::default();
        let now = Utc::now();
        q.enqueue(2, 10, now).await;
        q.enqueue(1, 10, now).await;

        let drained = q.drain().await;
        assert_eq!(drained.iter().map(|e| e.task_id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(q.is_empty().await);

        // task 1 fails again, task 2 succeeds
        q.enqueue(1, 10, now).await;
        assert!(q.complete(2, 10).await);
        assert_eq!(q.entries().await[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_dead_letter_after_cap() {
        let q = RetryQueue::new(Some(2));
        let now = Utc::now();

        assert_eq!(q.enqueue(1, 10, now).await, EnqueueOutcome::Queued);
        q.drain().await;
        assert_eq!(q.enqueue(1, 10, now).await, EnqueueOutcome::Queued);
        q.drain().await;
        assert_eq!(q.enqueue(1, 10, now).await, EnqueueOutcome::DeadLettered);
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn test_unbounded_by_default() {
        let q = RetryQueue::default();
        let now = Utc::now();
        for _ in 0..50 {
            q.enqueue(1, 10, now).await;
            q.drain().await;
        }
        assert_eq!(q.enqueue(1, 10, now).await, EnqueueOutcome::Queued);
    }
}
