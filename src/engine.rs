//! Orchestrator
//!
//! The [`Engine`] owns every cache, queue and session and runs the
//! background loops:
//!
//! - one [`Scheduler`] per connected bot identity
//! - the retry sweep, re-running every queued failure
//! - the freshness loop, reloading stale metadata and pruning idle feeds
//! - the change listener, invalidating both caches on notification
//!
//! Publish jobs run on their own tasks behind a [`JobRunner`], which turns
//! retryable failures and panics into retry-queue entries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cache::{ContentCache, MetadataCache};
use crate::compose::ContentComposer;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::listener::{ChangeEvent, ChangeListener, ListenerConfig};
use crate::metrics;
use crate::models::{BotId, TaskId};
use crate::pipeline::{Pipeline, Published};
use crate::publisher::{PublishError, Publisher};
use crate::resolver::EntityResolver;
use crate::scheduler::{DedupGuard, RetryQueue, Scheduler, SchedulerConfig, Trigger, TriggerSink};
use crate::storage::Store;
use crate::transport::{SessionRegistry, TransportFactory};

// ============================================================================
// Jobs
// ============================================================================

/// How one publish job ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Published { sent_ids: Vec<i64> },
    /// Failed and queued for the next sweep
    Queued { reason: String },
    /// Failed in a way a retry cannot fix
    Skipped { reason: String },
    Cancelled,
}

/// Runs publish jobs and routes their failures
#[derive(Clone)]
pub struct JobRunner {
    pipeline: Arc<Pipeline>,
    retry: Arc<RetryQueue>,
}

impl JobRunner {
    pub fn new(pipeline: Arc<Pipeline>, retry: Arc<RetryQueue>) -> Self {
        Self { pipeline, retry }
    }

    /// Run the publish path for `task_id` on its own task and settle the
    /// result against the retry queue
    pub async fn execute(&self, task_id: TaskId, bot_id: BotId) -> JobOutcome {
        let pipeline = Arc::clone(&self.pipeline);
        let joined = tokio::spawn(async move { pipeline.run(task_id, bot_id).await }).await;

        let result: std::result::Result<Published, PublishError> = match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(PublishError::Panicked { task_id }),
            Err(_) => return JobOutcome::Cancelled,
        };

        match result {
            Ok(published) => {
                self.retry.complete(task_id, bot_id).await;
                JobOutcome::Published {
                    sent_ids: published.delivery.sent_ids,
                }
            }
            Err(e) if e.is_retryable() => {
                metrics::record_publish(e.kind());
                match &e {
                    PublishError::Transport(t) if t.is_transient() => {
                        tracing::warn!(task_id, bot_id, error = %e, "Publish failed, queued for retry");
                    }
                    _ => {
                        tracing::error!(task_id, bot_id, error = %e, "Publish failed, queued for retry");
                    }
                }
                self.retry.enqueue(task_id, bot_id, Utc::now()).await;
                JobOutcome::Queued {
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                metrics::record_publish(e.kind());
                tracing::warn!(task_id, bot_id, error = %e, "Publish skipped");
                self.retry.complete(task_id, bot_id).await;
                JobOutcome::Skipped {
                    reason: e.to_string(),
                }
            }
        }
    }
}

impl TriggerSink for JobRunner {
    fn dispatch(&self, trigger: Trigger, delay: Duration) {
        let runner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            runner.execute(trigger.task_id, trigger.bot_id).await;
        });
    }
}

/// Counts from one retry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub attempted: usize,
    pub published: usize,
    pub requeued: usize,
    pub dropped: usize,
}

// ============================================================================
// Engine
// ============================================================================

/// Intervals of the background loops
#[derive(Debug, Clone)]
struct LoopSettings {
    retry_interval: Duration,
    freshness_interval: Duration,
    content_ttl: Duration,
}

/// Owner of the caches, queues and sessions
pub struct Engine {
    scheduler_config: SchedulerConfig,
    loops: LoopSettings,
    store: Arc<dyn Store>,
    factory: Arc<dyn TransportFactory>,
    sessions: Arc<SessionRegistry>,
    metadata: Arc<MetadataCache>,
    content: Arc<ContentCache>,
    dedup: Arc<DedupGuard>,
    retry: Arc<RetryQueue>,
    runner: JobRunner,
}

impl Engine {
    /// Build every service from `config`
    pub fn new(config: &Config, store: Arc<dyn Store>, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        config.validate()?;

        let metadata = Arc::new(MetadataCache::new(Arc::clone(&store), config.metadata_refresh()));
        let content = Arc::new(ContentCache::new(
            ContentComposer::new(config.cache.fetch_limit),
            config.content_ttl(),
        ));
        let resolver = Arc::new(EntityResolver::new(config.peer_ttl()));
        let sessions = Arc::new(SessionRegistry::new());
        let dedup = Arc::new(DedupGuard::new(config.dedup_window(), config.dedup_prune_after()));
        let retry = Arc::new(RetryQueue::new(config.retry.max_attempts));

        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&metadata),
            Arc::clone(&content),
            resolver,
            Arc::clone(&sessions),
            Arc::clone(&store),
            Publisher::new(config.album_pacing()),
        ));

        Ok(Self {
            scheduler_config: config.scheduler_config()?,
            loops: LoopSettings {
                retry_interval: config.retry_interval(),
                freshness_interval: config.metadata_refresh(),
                content_ttl: config.content_ttl(),
            },
            store,
            factory,
            sessions,
            metadata,
            content,
            dedup,
            retry: Arc::clone(&retry),
            runner: JobRunner::new(pipeline, retry),
        })
    }

    /// Open a session for every active identity.
    ///
    /// Identities that fail to connect are logged and skipped; it is an
    /// error only when none connects.
    pub async fn connect_sessions(&self) -> Result<usize> {
        let snapshot = self.metadata.snapshot().await?;

        for bot in snapshot.active_bots() {
            if self.sessions.get(bot.id).await.is_some() {
                continue;
            }
            match self.factory.connect(bot).await {
                Ok(transport) => {
                    tracing::info!(bot_id = bot.id, name = %bot.name, "Session connected");
                    self.sessions.insert(transport).await;
                }
                Err(e) => {
                    tracing::warn!(bot_id = bot.id, name = %bot.name, error = %e, "Session failed, skipping bot");
                }
            }
        }

        let connected = self.sessions.len().await;
        if connected == 0 {
            return Err(Error::other("no bot identity could connect"));
        }
        Ok(connected)
    }

    /// Scheduler for one connected identity
    pub fn scheduler(&self, bot_id: BotId) -> Scheduler {
        Scheduler::new(
            bot_id,
            self.scheduler_config.clone(),
            Arc::clone(&self.metadata),
            Arc::clone(&self.dedup),
        )
    }

    /// Run one publish job; bypasses the dedup guard
    pub async fn publish_now(&self, task_id: TaskId, bot_id: BotId) -> JobOutcome {
        self.runner.execute(task_id, bot_id).await
    }

    /// Drain the retry queue and re-run every entry
    pub async fn sweep_retries(&self) -> SweepReport {
        let entries = self.retry.drain().await;
        if entries.is_empty() {
            return SweepReport::default();
        }
        tracing::info!(entries = entries.len(), "Retry sweep started");

        let mut report = SweepReport::default();
        for entry in entries {
            report.attempted += 1;
            match self.runner.execute(entry.task_id, entry.bot_id).await {
                JobOutcome::Published { .. } => report.published += 1,
                JobOutcome::Queued { .. } => report.requeued += 1,
                JobOutcome::Skipped { .. } | JobOutcome::Cancelled => report.dropped += 1,
            }
        }

        tracing::info!(
            attempted = report.attempted,
            published = report.published,
            requeued = report.requeued,
            dropped = report.dropped,
            "Retry sweep finished"
        );
        report
    }

    /// Invalidate both caches after an administrative change
    pub async fn handle_change(&self, event: &ChangeEvent) {
        match &event.notification {
            Some(n) => tracing::info!(table = %n.table, op = %n.op, id = ?n.id, "Change notification, invalidating caches"),
            None => tracing::info!("Change notification, invalidating caches"),
        }
        self.metadata.invalidate().await;
        self.content.invalidate().await;
    }

    /// Reload stale metadata and drop feeds idle for twice their TTL
    pub async fn check_freshness(&self) {
        match self.metadata.refresh_if_stale().await {
            Ok(true) => tracing::debug!("Metadata refreshed"),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Metadata refresh failed"),
        }
        self.content.prune_older_than(self.loops.content_ttl * 2).await;
    }

    /// Connect sessions and run every loop until `shutdown` flips to `true`,
    /// then close the sessions
    pub async fn run(
        self: Arc<Self>,
        listener: Option<ListenerConfig>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let connected = self.connect_sessions().await?;
        tracing::info!(sessions = connected, "Engine started");

        let sink: Arc<dyn TriggerSink> = Arc::new(self.runner.clone());
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        for bot_id in self.sessions.bot_ids().await {
            let scheduler = self.scheduler(bot_id);
            handles.push(tokio::spawn(scheduler.run(Arc::clone(&sink), shutdown.clone())));
        }

        handles.push(self.spawn_periodic(self.loops.retry_interval, shutdown.clone(), |engine| async move {
            engine.sweep_retries().await;
        }));
        handles.push(self.spawn_periodic(self.loops.freshness_interval, shutdown.clone(), |engine| async move {
            engine.check_freshness().await;
        }));

        if let Some(config) = listener {
            let (tx, mut rx) = mpsc::channel::<ChangeEvent>(64);
            handles.push(tokio::spawn(ChangeListener::new(config).run(tx, shutdown.clone())));

            let engine = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    engine.handle_change(&event).await;
                }
            }));
        }

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        tracing::info!("Shutting down");

        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(error = %e, "Background loop panicked");
                }
            }
        }

        self.sessions.disconnect_all().await;
        tracing::info!("Engine stopped");
        Ok(())
    }

    /// Run `f` every `period`, first after one full period
    fn spawn_periodic<F, Fut>(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
        f: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => f(Arc::clone(&engine)).await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn metadata(&self) -> &Arc<MetadataCache> {
        &self.metadata
    }

    pub fn content(&self) -> &Arc<ContentCache> {
        &self.content
    }

    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.retry
    }

    pub fn dedup(&self) -> &Arc<DedupGuard> {
        &self.dedup
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}
