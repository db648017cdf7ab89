//! Configuration store access
//!
//! The engine reads bots, tasks (with their time slots) and channels, and
//! writes one publication record after every confirmed send.
//!
//! - [`Store`] - storage abstraction used by the caches and the pipeline
//! - [`MemoryStore`] - in-memory implementation for tests
//! - [`postgres::PostgresStore`] - PostgreSQL implementation (deadpool pool)

pub mod postgres;

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{BotId, BotIdentity, Channel, Task, TaskId};

pub use postgres::{PostgresConfig, PostgresStore};

/// Storage failures
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    #[error("invalid row in {table}: {reason}")]
    InvalidRow { table: &'static str, reason: String },
}

impl StorageError {
    pub fn invalid_row(table: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidRow {
            table,
            reason: reason.into(),
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Bookkeeping row written after a confirmed send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationRecord {
    pub task_id: TaskId,
    pub bot_id: BotId,
    pub published_at: DateTime<Utc>,
    /// Source message ids of the published post
    pub source_ids: Vec<i64>,
    /// Ids of the messages created in the target
    pub sent_ids: Vec<i64>,
}

impl PublicationRecord {
    /// First member id of the published post
    pub fn post_key(&self) -> Option<i64> {
        self.source_ids.first().copied()
    }
}

/// Storage abstraction
#[async_trait]
pub trait Store: Send + Sync {
    async fn load_bots(&self) -> StorageResult<Vec<BotIdentity>>;

    /// Tasks with their time slots
    async fn load_tasks(&self) -> StorageResult<Vec<Task>>;

    async fn load_channels(&self) -> StorageResult<Vec<Channel>>;

    /// Write bookkeeping for a confirmed send, in one transaction
    async fn record_publication(&self, record: &PublicationRecord) -> StorageResult<()>;

    /// First member id of the post `task_id` published most recently
    async fn last_published(&self, task_id: TaskId) -> StorageResult<Option<i64>>;
}

// ============================================================================
// Memory Implementation (for testing)
// ============================================================================

#[derive(Default)]
struct MemoryState {
    bots: Vec<BotIdentity>,
    tasks: Vec<Task>,
    channels: Vec<Channel>,
    publications: Vec<PublicationRecord>,
    loads: usize,
    fail_loads: bool,
}

/// In-memory [`Store`]
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn put_bot(&self, bot: BotIdentity) {
        let mut st = self.write();
        st.bots.retain(|b| b.id != bot.id);
        st.bots.push(bot);
    }

    pub fn put_task(&self, task: Task) {
        let mut st = self.write();
        st.tasks.retain(|t| t.id != task.id);
        st.tasks.push(task);
    }

    pub fn remove_task(&self, task_id: TaskId) {
        self.write().tasks.retain(|t| t.id != task_id);
    }

    pub fn put_channel(&self, channel: Channel) {
        let mut st = self.write();
        st.channels.retain(|c| c.id != channel.id);
        st.channels.push(channel);
    }

    pub fn publications(&self) -> Vec<PublicationRecord> {
        self.read().publications.clone()
    }

    /// Number of full task loads served
    pub fn task_loads(&self) -> usize {
        self.read().loads
    }

    /// Make every load fail until switched off
    pub fn set_failing(&self, failing: bool) {
        self.write().fail_loads = failing;
    }

    fn check(&self) -> StorageResult<()> {
        if self.read().fail_loads {
            return Err(StorageError::Pool("store unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_bots(&self) -> StorageResult<Vec<BotIdentity>> {
        self.check()?;
        Ok(self.read().bots.clone())
    }

    async fn load_tasks(&self) -> StorageResult<Vec<Task>> {
        self.check()?;
        let mut st = self.write();
        st.loads += 1;
        Ok(st.tasks.clone())
    }

    async fn load_channels(&self) -> StorageResult<Vec<Channel>> {
        self.check()?;
        Ok(self.read().channels.clone())
    }

    async fn record_publication(&self, record: &PublicationRecord) -> StorageResult<()> {
        self.write().publications.push(record.clone());
        Ok(())
    }

    async fn last_published(&self, task_id: TaskId) -> StorageResult<Option<i64>> {
        Ok(self
            .read()
            .publications
            .iter()
            .rev()
            .find(|r| r.task_id == task_id)
            .and_then(PublicationRecord::post_key))
    }
}

/// Index a list of records by id
pub(crate) fn index_by<T, K, F>(items: Vec<T>, key: F) -> HashMap<K, T>
where
    K: Eq + std::hash::Hash,
    F: Fn(&T) -> K,
{
    items.into_iter().map(|item| (key(&item), item)).collect()
}
