//! Per-identity publication scheduling
//!
//! Each active bot identity runs one [`Scheduler`] loop. Every check
//! interval it reads the bot's tasks from the [`MetadataCache`], matches
//! their weekly slots against the local time and hands due tasks to a
//! [`TriggerSink`], staggered so identities ticking in lockstep do not
//! burst.
//!
//! # Modules
//!
//! - [`slots`] - weekday/offset matching and slot planning
//! - [`dedup`] - per-task trigger suppression window
//! - [`retry`] - queue of failed publications for the retry sweep
//! - [`error`] - scheduler errors
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use postrelay::scheduler::{Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::new(bot_id, SchedulerConfig::default(), metadata, dedup);
//! tokio::spawn(scheduler.run(sink, shutdown_rx));
//! ```

pub mod dedup;
pub mod error;
pub mod retry;
pub mod slots;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::cache::MetadataCache;
use crate::metrics;
use crate::models::{BotId, TaskId, TimeSlot};

pub use dedup::DedupGuard;
pub use error::{SchedulerError, SchedulerResult};
pub use retry::{EnqueueOutcome, RetryEntry, RetryQueue};

/// Default process time zone
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Europe::Moscow;

// ============================================================================
// Configuration
// ============================================================================

/// Scheduler loop configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between passes
    pub check_interval: Duration,

    /// Maximum distance between now and a slot for it to fire
    pub tolerance: Duration,

    /// Delay between handing consecutive due tasks off
    pub stagger: Duration,

    /// Zone the weekly slots are expressed in
    pub timezone: Tz,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            tolerance: Duration::from_secs(25),
            stagger: Duration::from_secs(2),
            timezone: DEFAULT_TIMEZONE,
        }
    }
}

impl SchedulerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.check_interval.is_zero() {
            return Err(SchedulerError::invalid_config(
                "check_interval",
                "must be greater than zero",
            ));
        }

        if self.tolerance.as_secs() >= 12 * 3600 {
            return Err(SchedulerError::invalid_config(
                "tolerance",
                "must be shorter than half a day",
            ));
        }

        // a window narrower than one interval can fall between two passes
        if self.tolerance * 2 < self.check_interval {
            tracing::warn!(
                tolerance_secs = self.tolerance.as_secs(),
                check_interval_secs = self.check_interval.as_secs(),
                "Trigger window is narrower than the check interval, slots may be missed"
            );
        }

        Ok(())
    }

    /// Parse an IANA zone name
    pub fn parse_timezone(name: &str) -> SchedulerResult<Tz> {
        name.trim()
            .parse::<Tz>()
            .map_err(|_| SchedulerError::invalid_timezone(name))
    }
}

// ============================================================================
// Triggers
// ============================================================================

/// A task whose slot matched on a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trigger {
    pub task_id: TaskId,
    pub bot_id: BotId,
    pub slot: TimeSlot,
    pub fired_at: DateTime<Utc>,
}

/// Receiver of due tasks
///
/// Implementations must not block: the publish path is expected to be
/// spawned so one task never holds up the rest of the pass.
pub trait TriggerSink: Send + Sync {
    /// Start publishing `trigger` after `delay`
    fn dispatch(&self, trigger: Trigger, delay: Duration);
}

// ============================================================================
// Scheduler
// ============================================================================

/// Tick loop of one bot identity
pub struct Scheduler {
    bot_id: BotId,
    config: SchedulerConfig,
    metadata: Arc<MetadataCache>,
    dedup: Arc<DedupGuard>,
}

impl Scheduler {
    pub fn new(
        bot_id: BotId,
        config: SchedulerConfig,
        metadata: Arc<MetadataCache>,
        dedup: Arc<DedupGuard>,
    ) -> Self {
        Self {
            bot_id,
            config,
            metadata,
            dedup,
        }
    }

    pub fn bot_id(&self) -> BotId {
        self.bot_id
    }

    /// Due, non-suppressed tasks of this identity at `now`.
    ///
    /// Every returned trigger has already been recorded in the dedup guard.
    pub async fn evaluate(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<Trigger>> {
        let snapshot = self.metadata.snapshot().await?;
        self.dedup.prune(now).await;

        let mut due = Vec::new();
        for task in snapshot.schedulable_tasks(self.bot_id) {
            let Some(slot) =
                slots::matching_slot(&task.slots, now, self.config.timezone, self.config.tolerance)
            else {
                continue;
            };
            tracing::debug!(task_id = task.id, slot = %slot, "Slot matched");

            if !self.dedup.check_and_record(task.id, now).await {
                continue;
            }

            tracing::info!(
                task_id = task.id,
                bot_id = self.bot_id,
                slot = %slot,
                "Task triggered"
            );
            metrics::record_trigger(self.bot_id);
            due.push(Trigger {
                task_id: task.id,
                bot_id: self.bot_id,
                slot,
                fired_at: now,
            });
        }

        Ok(due)
    }

    /// One pass: evaluate and hand off. Never fails; returns the number of
    /// tasks dispatched.
    pub async fn tick(&self, sink: &dyn TriggerSink, now: DateTime<Utc>) -> usize {
        let triggers = match self.evaluate(now).await {
            Ok(triggers) => triggers,
            Err(e) => {
                tracing::warn!(bot_id = self.bot_id, error = %e, "Scheduler pass skipped");
                return 0;
            }
        };

        let count = triggers.len();
        for (i, trigger) in triggers.into_iter().enumerate() {
            let delay = self.config.stagger * (i as u32 + 1);
            sink.dispatch(trigger, delay);
        }
        count
    }

    /// Run passes every check interval until `shutdown` flips to `true`
    pub async fn run(self, sink: Arc<dyn TriggerSink>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            bot_id = self.bot_id,
            interval_secs = self.config.check_interval.as_secs(),
            timezone = %self.config.timezone,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(sink.as_ref(), Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(bot_id = self.bot_id, "Scheduler stopped");
    }
}
