//! The publish path of one task
//!
//! metadata -> session -> resolve source and target -> content feed ->
//! select -> render -> send -> post-publish policy -> bookkeeping.
//!
//! Every scheduler trigger and every retry sweep entry goes through
//! [`Pipeline::run`]. Errors are returned to the caller, which decides
//! whether they enter the retry queue.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::cache::{ContentCache, MetadataCache};
use crate::compose::{select_post, ContentComposer};
use crate::metrics;
use crate::models::{AfterPublish, BotId, ChoiceMode, Task, TaskId};
use crate::publisher::{Delivery, PublishError, PublishPolicy, Publisher};
use crate::resolver::EntityResolver;
use crate::storage::{PublicationRecord, Store};
use crate::transport::SessionRegistry;

/// A confirmed publication
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Published {
    pub task_id: TaskId,
    pub bot_id: BotId,
    /// Source message ids of the published post
    pub source_ids: Vec<i64>,
    pub delivery: Delivery,
}

/// Shared services the publish path runs against
pub struct Pipeline {
    metadata: Arc<MetadataCache>,
    content: Arc<ContentCache>,
    resolver: Arc<EntityResolver>,
    sessions: Arc<SessionRegistry>,
    store: Arc<dyn Store>,
    composer: ContentComposer,
    publisher: Publisher,
    /// First-member id of the last post published per task
    cursors: Mutex<HashMap<TaskId, i64>>,
}

impl Pipeline {
    pub fn new(
        metadata: Arc<MetadataCache>,
        content: Arc<ContentCache>,
        resolver: Arc<EntityResolver>,
        sessions: Arc<SessionRegistry>,
        store: Arc<dyn Store>,
        publisher: Publisher,
    ) -> Self {
        Self {
            metadata,
            content,
            resolver,
            sessions,
            store,
            composer: ContentComposer::default(),
            publisher,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Publish one post for `task_id` through `bot_id`'s session
    pub async fn run(&self, task_id: TaskId, bot_id: BotId) -> Result<Published, PublishError> {
        let _timer = metrics::start_publish_timer();
        let snapshot = self.metadata.snapshot().await?;

        let task = snapshot.task(task_id).ok_or(PublishError::TaskMissing { task_id })?;
        if !task.is_enabled() {
            return Err(PublishError::TaskInactive { task_id });
        }
        let source = snapshot
            .channel(task.source_id)
            .ok_or(PublishError::ChannelMissing {
                task_id,
                channel_id: task.source_id,
            })?;
        let target = snapshot
            .channel(task.target_id)
            .ok_or(PublishError::ChannelMissing {
                task_id,
                channel_id: task.target_id,
            })?;

        let transport = self
            .sessions
            .get(bot_id)
            .await
            .ok_or(PublishError::NoSession { bot_id })?;

        let source_peer = self.resolver.resolve(&transport, &source.reference).await?;
        let target_peer = self.resolver.resolve(&transport, &target.reference).await?;

        tracing::info!(
            task_id,
            bot_id,
            source = %source.name,
            target = %target.name,
            "Publishing"
        );

        let posts = self.content.posts(&transport, &source_peer).await?;
        let last = self.cursor(task).await;
        let post = select_post(&posts, task.choice_mode, last)?;
        let rendered = self.composer.render(post, source.suffix())?;
        let source_ids = post.ids();

        let policy = PublishPolicy {
            pin: task.pin,
            delete_source: task.after_publish == AfterPublish::Remove,
        };
        let delivery = self
            .publisher
            .publish(
                transport.as_ref(),
                &target_peer,
                &rendered,
                &source_peer,
                &source_ids,
                policy,
            )
            .await?;

        if delivery.source_deleted {
            self.content
                .remove_messages((bot_id, source_peer.id), &source_ids)
                .await;
        }
        if let Some(&first) = source_ids.first() {
            self.cursors.lock().await.insert(task_id, first);
        }

        let record = PublicationRecord {
            task_id,
            bot_id,
            published_at: Utc::now(),
            source_ids: source_ids.clone(),
            sent_ids: delivery.sent_ids.clone(),
        };
        if let Err(e) = self.store.record_publication(&record).await {
            tracing::warn!(task_id, error = %e, "Publication bookkeeping failed");
        }

        metrics::record_publish("success");
        tracing::info!(
            task_id,
            bot_id,
            variant = rendered.variant_name(),
            source_ids = ?source_ids,
            sent_ids = ?delivery.sent_ids,
            fallback = delivery.fallback,
            "Published"
        );

        Ok(Published {
            task_id,
            bot_id,
            source_ids,
            delivery,
        })
    }

    /// Sequential cursor of `task`, seeded from the publication log
    async fn cursor(&self, task: &Task) -> Option<i64> {
        if task.choice_mode != ChoiceMode::Sequential {
            return None;
        }
        if let Some(&id) = self.cursors.lock().await.get(&task.id) {
            return Some(id);
        }

        match self.store.last_published(task.id).await {
            Ok(last) => {
                if let Some(id) = last {
                    self.cursors.lock().await.entry(task.id).or_insert(id);
                }
                last
            }
            Err(e) => {
                tracing::warn!(task_id = task.id, error = %e, "Could not read last publication");
                None
            }
        }
    }

    pub fn metadata(&self) -> &Arc<MetadataCache> {
        &self.metadata
    }

    pub fn content(&self) -> &Arc<ContentCache> {
        &self.content
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Channel, ChannelRef, RawMessage, TimeSlot};
    use crate::storage::MemoryStore;
    use crate::transport::memory::{MemoryTransport, Sent};
    use chrono::TimeZone;
    use std::time::Duration;

    fn msg(id: i64, text: &str) -> RawMessage {
        RawMessage {
            id,
            date: Utc.timestamp_opt(1_700_000_000 + id, 0).single().unwrap(),
            text: text.into(),
            entities: vec![],
            media: None,
            grouped_id: None,
            is_service: false,
        }
    }

    fn channel(id: i64, telegram_id: i64, suffix: Option<&str>) -> Channel {
        Channel {
            id,
            name: format!("ch{id}"),
            reference: ChannelRef::by_id(telegram_id),
            text_suffix: suffix.map(str::to_string),
            add_suffix: suffix.is_some(),
        }
    }

    fn task(mode: ChoiceMode, after: AfterPublish) -> Task {
        Task {
            id: 1,
            bot_id: 1,
            source_id: 10,
            target_id: 20,
            is_active: true,
            is_global_active: true,
            choice_mode: mode,
            after_publish: after,
            pin: false,
            slots: vec![TimeSlot::new(0, 0).unwrap()],
        }
    }

    async fn setup(t: Task) -> (Arc<MemoryTransport>, Arc<MemoryStore>, Pipeline) {
        let mem = Arc::new(MemoryTransport::new(1));
        mem.add_peer(-100, None);
        mem.add_peer(-200, None);
        mem.set_history(-100, vec![msg(1, "one"), msg(2, "two"), msg(3, "three")]);

        let store = Arc::new(MemoryStore::new());
        store.put_task(t);
        store.put_channel(channel(10, -100, Some("via @src")));
        store.put_channel(channel(20, -200, None));

        let sessions = Arc::new(SessionRegistry::new());
        sessions.insert(mem.clone()).await;

        let pipeline = Pipeline::new(
            Arc::new(MetadataCache::new(store.clone(), Duration::from_secs(60))),
            Arc::new(ContentCache::new(ContentComposer::default(), Duration::from_secs(300))),
            Arc::new(EntityResolver::default()),
            sessions,
            store.clone(),
            Publisher::default(),
        );
        (mem, store, pipeline)
    }

    fn sent_texts(mem: &MemoryTransport) -> Vec<String> {
        mem.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text { body, .. } => Some(body.text),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_first_mode_with_source_suffix() {
        let (mem, store, pipeline) = setup(task(ChoiceMode::First, AfterPublish::Cycle)).await;
        let published = pipeline.run(1, 1).await.unwrap();

        assert_eq!(published.source_ids, vec![1]);
        assert_eq!(sent_texts(&mem), vec!["one\nvia @src".to_string()]);
        assert_eq!(store.publications().len(), 1);
    }

    #[tokio::test]
    async fn test_sequential_walks_and_wraps() {
        let (mem, _store, pipeline) = setup(task(ChoiceMode::Sequential, AfterPublish::Cycle)).await;
        for _ in 0..4 {
            pipeline.run(1, 1).await.unwrap();
        }
        let firsts: Vec<String> = sent_texts(&mem)
            .into_iter()
            .map(|t| t.lines().next().unwrap_or_default().to_string())
            .collect();
        assert_eq!(firsts, vec!["one", "two", "three", "one"]);
    }

    #[tokio::test]
    async fn test_remove_policy_deletes_and_evicts() {
        let (mem, _store, pipeline) = setup(task(ChoiceMode::First, AfterPublish::Remove)).await;

        let first = pipeline.run(1, 1).await.unwrap();
        assert!(first.delivery.source_deleted);
        assert_eq!(mem.deleted(), vec![(-100, vec![1])]);

        let second = pipeline.run(1, 1).await.unwrap();
        assert_eq!(second.source_ids, vec![2]);
    }

    #[tokio::test]
    async fn test_wiring_errors_are_not_retryable() {
        let (_mem, store, pipeline) = setup(task(ChoiceMode::First, AfterPublish::Cycle)).await;

        let err = pipeline.run(99, 1).await.unwrap_err();
        assert!(matches!(err, PublishError::TaskMissing { task_id: 99 }));
        assert!(!err.is_retryable());

        let err = pipeline.run(1, 5).await.unwrap_err();
        assert!(matches!(err, PublishError::NoSession { bot_id: 5 }));

        store.put_task(Task {
            is_active: false,
            ..task(ChoiceMode::First, AfterPublish::Cycle)
        });
        pipeline.metadata().invalidate().await;
        assert!(matches!(
            pipeline.run(1, 1).await.unwrap_err(),
            PublishError::TaskInactive { .. }
        ));
    }

    #[tokio::test]
    async fn test_empty_source_is_content_error() {
        let (mem, _store, pipeline) = setup(task(ChoiceMode::Random, AfterPublish::Cycle)).await;
        mem.set_history(-100, vec![]);
        let err = pipeline.run(1, 1).await.unwrap_err();
        assert!(matches!(err, PublishError::Compose(_)));
        assert!(!err.is_retryable());
    }
}
