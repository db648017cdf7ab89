//! Trigger suppression per task
//!
//! A task that fired less than the guard window ago is skipped, which keeps
//! consecutive scheduler passes inside the same slot tolerance from
//! publishing twice. Entries older than the prune horizon are dropped.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::metrics;
use crate::models::TaskId;

/// Default suppression window
pub const DEFAULT_GUARD_WINDOW: Duration = Duration::from_secs(60);

/// Default age after which entries are pruned
pub const DEFAULT_PRUNE_AFTER: Duration = Duration::from_secs(300);

/// Process-wide last-trigger table
#[derive(Debug)]
pub struct DedupGuard {
    window: chrono::Duration,
    prune_after: chrono::Duration,
    last: Mutex<HashMap<TaskId, DateTime<Utc>>>,
}

impl Default for DedupGuard {
    fn default() -> Self {
        Self::new(DEFAULT_GUARD_WINDOW, DEFAULT_PRUNE_AFTER)
    }
}

impl DedupGuard {
    pub fn new(window: Duration, prune_after: Duration) -> Self {
        Self {
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX),
            prune_after: chrono::Duration::from_std(prune_after).unwrap_or(chrono::Duration::MAX),
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Record a trigger of `task_id` at `now`.
    ///
    /// Returns `false` when the task already fired within the window; a
    /// suppressed trigger does not move the recorded time.
    pub async fn check_and_record(&self, task_id: TaskId, now: DateTime<Utc>) -> bool {
        let mut last = self.last.lock().await;

        if let Some(prev) = last.get(&task_id) {
            if now.signed_duration_since(*prev) < self.window {
                tracing::debug!(task_id, last = %prev, "Trigger suppressed by dedup guard");
                metrics::record_dedup_suppressed();
                return false;
            }
        }

        last.insert(task_id, now);
        true
    }

    /// Drop entries older than the prune horizon
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut last = self.last.lock().await;
        let before = last.len();
        last.retain(|_, at| now.signed_duration_since(*at) <= self.prune_after);
        before - last.len()
    }

    pub async fn len(&self) -> usize {
        self.last.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.last.lock().await.is_empty()
    }
}
