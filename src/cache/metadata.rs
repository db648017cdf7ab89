//! Metadata cache: bots, tasks and channels
//!
//! One immutable [`MetadataSnapshot`] is shared by all readers and replaced
//! wholesale on reload. Invalidation drops the snapshot, so the next reader
//! reloads synchronously before using any metadata.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::models::{BotId, BotIdentity, Channel, ChannelId, Task, TaskId};
use crate::storage::{index_by, Store, StorageResult};

use super::CacheEntry;

/// Point-in-time copy of the administrative data
#[derive(Debug, Clone, Default)]
pub struct MetadataSnapshot {
    pub bots: HashMap<BotId, BotIdentity>,
    pub tasks: HashMap<TaskId, Task>,
    pub channels: HashMap<ChannelId, Channel>,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl MetadataSnapshot {
    pub fn new(bots: Vec<BotIdentity>, tasks: Vec<Task>, channels: Vec<Channel>) -> Self {
        Self {
            bots: index_by(bots, |b| b.id),
            tasks: index_by(tasks, |t| t.id),
            channels: index_by(channels, |c| c.id),
            loaded_at: Some(Utc::now()),
        }
    }

    /// Enabled tasks of `bot_id` that have at least one slot, ordered by id
    pub fn schedulable_tasks(&self, bot_id: BotId) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.bot_id == bot_id && t.is_enabled() && !t.slots.is_empty())
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    pub fn active_bots(&self) -> Vec<&BotIdentity> {
        let mut bots: Vec<&BotIdentity> = self.bots.values().filter(|b| b.is_active).collect();
        bots.sort_by_key(|b| b.id);
        bots
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }
}

/// Cache of the administrative data with timed refresh and invalidation
pub struct MetadataCache {
    store: Arc<dyn Store>,
    refresh: Duration,
    current: RwLock<Option<CacheEntry<Arc<MetadataSnapshot>>>>,
    reload_lock: Mutex<()>,
}

impl MetadataCache {
    pub fn new(store: Arc<dyn Store>, refresh: Duration) -> Self {
        Self {
            store,
            refresh,
            current: RwLock::new(None),
            reload_lock: Mutex::new(()),
        }
    }

    /// Current snapshot; reloads first when missing or older than the
    /// refresh interval
    pub async fn snapshot(&self) -> StorageResult<Arc<MetadataSnapshot>> {
        if let Some(snap) = self.fresh().await {
            return Ok(snap);
        }

        let _guard = self.reload_lock.lock().await;
        // another caller may have reloaded while we waited
        if let Some(snap) = self.fresh().await {
            return Ok(snap);
        }
        self.load().await
    }

    async fn fresh(&self) -> Option<Arc<MetadataSnapshot>> {
        self.current
            .read()
            .await
            .as_ref()
            .filter(|e| e.is_fresh())
            .map(|e| Arc::clone(&e.value))
    }

    async fn load(&self) -> StorageResult<Arc<MetadataSnapshot>> {
        let bots = self.store.load_bots().await?;
        let tasks = self.store.load_tasks().await?;
        let channels = self.store.load_channels().await?;

        let snap = Arc::new(MetadataSnapshot::new(bots, tasks, channels));
        tracing::info!(
            bots = snap.bots.len(),
            tasks = snap.tasks.len(),
            channels = snap.channels.len(),
            "Metadata reloaded"
        );

        *self.current.write().await = Some(CacheEntry::new(Arc::clone(&snap), self.refresh));
        Ok(snap)
    }

    /// Reload if the snapshot is missing or past the refresh interval.
    /// Returns whether a reload happened.
    pub async fn refresh_if_stale(&self) -> StorageResult<bool> {
        if self.fresh().await.is_some() {
            return Ok(false);
        }
        let _guard = self.reload_lock.lock().await;
        if self.fresh().await.is_some() {
            return Ok(false);
        }
        self.load().await.map(|_| true)
    }

    /// Drop the snapshot; the next reader reloads
    pub async fn invalidate(&self) {
        *self.current.write().await = None;
    }

    pub async fn is_loaded(&self) -> bool {
        self.current.read().await.is_some()
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AfterPublish, ChoiceMode, TimeSlot};
    use crate::storage::MemoryStore;

    fn task(id: TaskId, bot_id: BotId, active: bool, slots: Vec<TimeSlot>) -> Task {
        Task {
            id,
            bot_id,
            source_id: 1,
            target_id: 2,
            is_active: active,
            is_global_active: true,
            choice_mode: ChoiceMode::First,
            after_publish: AfterPublish::Cycle,
            pin: false,
            slots,
        }
    }

    #[test]
    fn test_schedulable_filter() {
        let slot = TimeSlot::new(0, 0).unwrap();
        let snap = MetadataSnapshot::new(
            vec![],
            vec![
                task(3, 1, true, vec![slot]),
                task(1, 1, true, vec![slot]),
                task(2, 1, false, vec![slot]),
                task(4, 1, true, vec![]),
                task(5, 2, true, vec![slot]),
            ],
            vec![],
        );
        let ids: Vec<_> = snap.schedulable_tasks(1).iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_interval_and_invalidation() {
        let store = Arc::new(MemoryStore::new());
        store.put_task(task(1, 1, true, vec![]));
        let cache = MetadataCache::new(store.clone(), Duration::from_secs(60));

        assert!(!cache.is_loaded().await);
        cache.snapshot().await.unwrap();
        cache.snapshot().await.unwrap();
        assert_eq!(store.task_loads(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        cache.snapshot().await.unwrap();
        assert_eq!(store.task_loads(), 2);

        cache.invalidate().await;
        assert!(!cache.is_loaded().await);
        store.put_task(task(2, 1, true, vec![]));
        let snap = cache.snapshot().await.unwrap();
        assert_eq!(snap.tasks.len(), 2);
        assert_eq!(store.task_loads(), 3);
    }

    #[tokio::test]
    async fn test_refresh_if_stale() {
        let store = Arc::new(MemoryStore::new());
        let cache = MetadataCache::new(store.clone(), Duration::from_secs(60));
        assert!(cache.refresh_if_stale().await.unwrap());
        assert!(!cache.refresh_if_stale().await.unwrap());
    }
}
