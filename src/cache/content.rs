//! Content cache: composed post feed per (bot, source)
//!
//! A feed is fetched on first access and refetched once older than its TTL.
//! Between fetches a per-source event pump applies new-message and deletion
//! events from the transport incrementally and regroups the feed.
//! Invalidation clears every feed and aborts every pump.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::compose::{build_posts, ContentComposer};
use crate::metrics;
use crate::models::{BotId, Post, RawMessage};
use crate::transport::{PeerHandle, SourceEvent, Transport, TransportError, TransportResult};

use super::CacheEntry;

/// (bot id, source peer id)
pub type ContentKey = (BotId, i64);

#[derive(Debug, Clone)]
struct SourceFeed {
    messages: Vec<RawMessage>,
    posts: Arc<Vec<Post>>,
}

impl SourceFeed {
    fn new(messages: Vec<RawMessage>) -> Self {
        let messages: Vec<RawMessage> = messages.into_iter().filter(RawMessage::has_content).collect();
        let posts = Arc::new(build_posts(messages.iter().cloned()));
        Self { messages, posts }
    }

    fn regroup(&mut self) {
        self.posts = Arc::new(build_posts(self.messages.iter().cloned()));
    }

    fn apply(&mut self, event: SourceEvent, limit: usize) -> bool {
        match event {
            SourceEvent::NewMessage { message } => {
                if !message.has_content() || self.messages.iter().any(|m| m.id == message.id) {
                    return false;
                }
                self.messages.push(message);
                if self.messages.len() > limit {
                    self.messages.sort_by_key(RawMessage::sort_key);
                    let excess = self.messages.len() - limit;
                    self.messages.drain(..excess);
                }
            }
            SourceEvent::Deleted { ids } => {
                let before = self.messages.len();
                self.messages.retain(|m| !ids.contains(&m.id));
                if self.messages.len() == before {
                    return false;
                }
            }
        }
        self.regroup();
        true
    }
}

type Entries = Arc<RwLock<HashMap<ContentKey, CacheEntry<SourceFeed>>>>;

/// Per-source post feed cache
pub struct ContentCache {
    composer: ContentComposer,
    ttl: Duration,
    entries: Entries,
    pumps: Mutex<HashMap<ContentKey, JoinHandle<()>>>,
    /// Bumped on invalidation; fetches started before it are discarded
    generation: AtomicU64,
}

impl ContentCache {
    pub fn new(composer: ContentComposer, ttl: Duration) -> Self {
        Self {
            composer,
            ttl,
            entries: Arc::new(RwLock::new(HashMap::new())),
            pumps: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Feed of `peer` as seen by `transport`'s identity
    pub async fn posts(
        &self,
        transport: &Arc<dyn Transport>,
        peer: &PeerHandle,
    ) -> TransportResult<Arc<Vec<Post>>> {
        let key = (transport.bot_id(), peer.id);

        if let Some(entry) = self.entries.read().await.get(&key) {
            if entry.is_fresh() {
                metrics::record_cache_request("content", true);
                tracing::debug!(bot_id = key.0, source = key.1, "Content cache hit");
                return Ok(Arc::clone(&entry.value.posts));
            }
        }
        metrics::record_cache_request("content", false);

        let generation = self.generation.load(Ordering::Acquire);
        let messages = transport
            .iterate_messages(peer, self.composer.fetch_limit())
            .await?;
        let feed = SourceFeed::new(messages);
        let posts = Arc::clone(&feed.posts);

        tracing::debug!(
            bot_id = key.0,
            source = key.1,
            posts = posts.len(),
            "Source feed fetched"
        );

        {
            let mut entries = self.entries.write().await;
            // checked under the guard so a concurrent invalidate cannot slip in
            if self.generation.load(Ordering::Acquire) != generation {
                tracing::debug!(bot_id = key.0, source = key.1, "Discarding feed fetched before invalidation");
                return Ok(posts);
            }
            entries.insert(key, CacheEntry::new(feed, self.ttl));
        }
        self.ensure_pump(key, transport, peer, generation).await;

        Ok(posts)
    }

    async fn ensure_pump(
        &self,
        key: ContentKey,
        transport: &Arc<dyn Transport>,
        peer: &PeerHandle,
        generation: u64,
    ) {
        let mut pumps = self.pumps.lock().await;
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        if pumps.get(&key).is_some_and(|h| !h.is_finished()) {
            return;
        }

        let mut events = match transport.subscribe(peer).await {
            Ok(rx) => rx,
            Err(TransportError::Unsupported(_)) => return,
            Err(e) => {
                tracing::warn!(
                    bot_id = key.0,
                    source = key.1,
                    error = %e,
                    "Live subscription failed, relying on TTL refresh"
                );
                return;
            }
        };

        let entries = Arc::clone(&self.entries);
        let limit = self.composer.fetch_limit();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let mut map = entries.write().await;
                let Some(entry) = map.get_mut(&key) else {
                    // feed was dropped; the next fetch starts a new pump
                    break;
                };
                if entry.value.apply(event, limit) {
                    tracing::debug!(
                        bot_id = key.0,
                        source = key.1,
                        posts = entry.value.posts.len(),
                        "Feed updated from live event"
                    );
                }
            }
        });
        pumps.insert(key, handle);
    }

    /// Evict source messages that were just deleted by the publish policy
    pub async fn remove_messages(&self, key: ContentKey, ids: &[i64]) {
        if let Some(entry) = self.entries.write().await.get_mut(&key) {
            entry.value.apply(SourceEvent::Deleted { ids: ids.to_vec() }, usize::MAX);
        }
    }

    /// Clear every feed and stop every pump
    pub async fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.entries.write().await.clear();
        for (_, handle) in self.pumps.lock().await.drain() {
            handle.abort();
        }
        metrics::record_cache_invalidation();
    }

    /// Drop feeds untouched for longer than `max_age`, with their pumps.
    /// Returns the number of feeds removed.
    pub async fn prune_older_than(&self, max_age: Duration) -> usize {
        let expired: Vec<ContentKey> = {
            let mut map = self.entries.write().await;
            let keys: Vec<_> = map
                .iter()
                .filter(|(_, e)| e.age() > max_age)
                .map(|(k, _)| *k)
                .collect();
            for k in &keys {
                map.remove(k);
            }
            keys
        };

        if !expired.is_empty() {
            let mut pumps = self.pumps.lock().await;
            for k in &expired {
                if let Some(h) = pumps.remove(k) {
                    h.abort();
                }
            }
            tracing::debug!(removed = expired.len(), "Pruned idle source feeds");
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn contains(&self, key: &ContentKey) -> bool {
        self.entries.read().await.contains_key(key)
    }

    /// Number of pumps still running
    pub async fn active_pumps(&self) -> usize {
        self.pumps
            .lock()
            .await
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
