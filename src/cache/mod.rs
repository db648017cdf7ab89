//! In-process caches for the syndication engine
//!
//! This module provides the TTL primitives shared by every cache:
//! - [`CacheEntry`]: value stamped with its refresh time and TTL
//! - [`TtlMap`]: keyed entries evicted lazily on lookup past TTL
//!
//! and the two engine caches built on them:
//! - [`content::ContentCache`]: composed post feed per (bot, source)
//! - [`metadata::MetadataCache`]: bots, tasks and channels snapshot
//!
//! Time is read from `tokio::time::Instant`, so tests can pause and advance
//! the clock.

pub mod content;
pub mod metadata;

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

pub use content::ContentCache;
pub use metadata::{MetadataCache, MetadataSnapshot};

/// Value with its refresh stamp; usable iff `now - last_refreshed < ttl`
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub last_refreshed: Instant,
    pub ttl: Duration,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            last_refreshed: Instant::now(),
            ttl,
        }
    }

    pub fn age(&self) -> Duration {
        self.last_refreshed.elapsed()
    }

    pub fn is_fresh(&self) -> bool {
        self.age() < self.ttl
    }
}

/// Keyed TTL entries, evicted on the first lookup past their TTL
#[derive(Debug)]
pub struct TtlMap<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    ttl: Duration,
}

impl<K: Eq + Hash, V: Clone> TtlMap<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Fresh value for `key`; a stale entry is dropped
    pub fn get(&mut self, key: &K) -> Option<V> {
        match self.entries.get(key) {
            Some(entry) if entry.is_fresh() => Some(entry.value.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.entries.insert(key, CacheEntry::new(value, self.ttl));
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
