//! Peer resolution with caching
//!
//! Resolution order on a cache miss:
//! 1. direct lookup by numeric id
//! 2. lookup by username/link
//! 3. linear scan of the dialog list matching the numeric id
//!
//! A rate-limit answer sleeps for the mandated cooldown and repeats the same
//! lookup exactly once. Successful resolutions are cached per
//! (bot identity, logical reference) for the peer TTL.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::cache::TtlMap;
use crate::metrics;
use crate::models::{BotId, ChannelRef};
use crate::transport::{PeerHandle, Transport, TransportError, TransportResult};

/// Default peer cache TTL
pub const DEFAULT_PEER_TTL: Duration = Duration::from_secs(3600);

/// Resolution failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("channel reference is empty")]
    EmptyReference,

    #[error("could not resolve {reference}")]
    NotFound { reference: String },

    #[error("transport error while resolving {reference}: {source}")]
    Transport {
        reference: String,
        #[source]
        source: TransportError,
    },
}

impl ResolveError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { source, .. } if source.is_transient())
    }
}

/// Caching resolver shared by every identity
pub struct EntityResolver {
    cache: Mutex<TtlMap<(BotId, String), PeerHandle>>,
    /// Upper bound on a single mandated cooldown
    max_cooldown: Duration,
}

impl Default for EntityResolver {
    fn default() -> Self {
        Self::new(DEFAULT_PEER_TTL)
    }
}

impl EntityResolver {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(TtlMap::new(ttl)),
            max_cooldown: Duration::from_secs(300),
        }
    }

    /// Resolve `reference` through `transport`'s session
    pub async fn resolve(
        &self,
        transport: &Arc<dyn Transport>,
        reference: &ChannelRef,
    ) -> Result<PeerHandle, ResolveError> {
        if reference.is_empty() {
            return Err(ResolveError::EmptyReference);
        }

        let key = (transport.bot_id(), reference.cache_key());
        let cached = self.cache.lock().await.get(&key);
        metrics::record_cache_request("peer", cached.is_some());
        if let Some(peer) = cached {
            return Ok(peer);
        }

        let peer = self.lookup(transport.as_ref(), reference).await?;
        tracing::debug!(
            bot_id = key.0,
            reference = %reference,
            peer = peer.id,
            "Resolved peer"
        );
        self.cache.lock().await.insert(key, peer.clone());
        Ok(peer)
    }

    async fn lookup(&self, transport: &dyn Transport, reference: &ChannelRef) -> Result<PeerHandle, ResolveError> {
        let wrap = |source: TransportError| ResolveError::Transport {
            reference: reference.to_string(),
            source,
        };

        if let Some(id) = reference.id {
            match self.with_cooldown(|| transport.resolve_by_id(id)).await {
                Ok(peer) => return Ok(peer),
                Err(TransportError::NotFound(_)) => {}
                Err(e) if e.is_transient() => return Err(wrap(e)),
                Err(e) => {
                    tracing::debug!(id, error = %e, "Direct id lookup failed");
                }
            }
        }

        if let Some(username) = reference.username.as_deref() {
            match self.with_cooldown(|| transport.resolve_by_username(username)).await {
                Ok(peer) => return Ok(peer),
                Err(TransportError::NotFound(_)) => {}
                Err(e) if e.is_transient() => return Err(wrap(e)),
                Err(e) => {
                    tracing::debug!(username, error = %e, "Username lookup failed");
                }
            }
        }

        if let Some(id) = reference.id {
            let dialogs = self.with_cooldown(|| transport.dialogs()).await.map_err(wrap)?;
            if let Some(peer) = dialogs.into_iter().find(|p| p.id == id) {
                return Ok(peer);
            }
        }

        Err(ResolveError::NotFound {
            reference: reference.to_string(),
        })
    }

    /// Run `op`; on a rate limit sleep the cooldown and run it once more
    async fn with_cooldown<T, F, Fut>(&self, op: F) -> TransportResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = TransportResult<T>>,
    {
        match op().await {
            Err(TransportError::RateLimited { seconds }) => {
                let wait = Duration::from_secs(seconds).min(self.max_cooldown);
                tracing::warn!(seconds, "Rate limited during resolution, cooling down");
                tokio::time::sleep(wait).await;
                op().await
            }
            other => other,
        }
    }

    /// Drop every cached resolution
    pub async fn clear(&self) {
        self.cache.lock().await.clear();
    }

    pub async fn cached(&self) -> usize {
        self.cache.lock().await.len()
    }
}
