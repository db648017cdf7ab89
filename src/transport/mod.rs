//! Messaging transport capabilities
//!
//! The engine never speaks the wire protocol itself. It drives a
//! capability-typed client per bot identity:
//!
//! - [`Transport`] - peer resolution, history, sends, pins, deletes, live events
//! - [`TransportFactory`] - opens a session for a [`BotIdentity`]
//! - [`bridge`] - HTTP/JSON client for a session gateway
//! - [`memory`] - in-process implementation for tests
//! - [`dry_run`] - read-through wrapper that only logs writes

pub mod bridge;
pub mod dry_run;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};

use crate::compose::{FormattedText, MediaItem};
use crate::models::{BotId, BotIdentity, RawMessage};

pub use bridge::{GatewayConfig, GatewayFactory, GatewayTransport};
pub use dry_run::{DryRunFactory, DryRunTransport};
pub use memory::{MemoryFactory, MemoryTransport};

/// Opaque network address of a channel, chat or user
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerHandle {
    pub id: i64,
    #[serde(default)]
    pub access_hash: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
}

impl PeerHandle {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            access_hash: None,
            title: None,
        }
    }
}

/// Message created by a send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub id: i64,
}

/// Live change in a subscribed source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SourceEvent {
    NewMessage { message: RawMessage },
    Deleted { ids: Vec<i64> },
}

/// Transport failure classification
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Server asked to wait before repeating the call
    #[error("rate limited, retry after {seconds}s")]
    RateLimited { seconds: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: u16, message: String },

    #[error("session not authorized: {0}")]
    Unauthorized(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl TransportError {
    /// Worth repeating the same call later
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Connection(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::NotFound(_) => "not_found",
            Self::Connection(_) => "connection",
            Self::Rpc { .. } => "rpc",
            Self::Unauthorized(_) => "unauthorized",
            Self::Protocol(_) => "protocol",
            Self::Unsupported(_) => "unsupported",
        }
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Capabilities the engine needs from a messaging session
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity this session belongs to
    fn bot_id(&self) -> BotId;

    async fn resolve_by_id(&self, id: i64) -> TransportResult<PeerHandle>;

    async fn resolve_by_username(&self, username: &str) -> TransportResult<PeerHandle>;

    /// Every dialog visible to this session
    async fn dialogs(&self) -> TransportResult<Vec<PeerHandle>>;

    /// Up to `limit` most recent messages, in any order
    async fn iterate_messages(&self, peer: &PeerHandle, limit: usize) -> TransportResult<Vec<RawMessage>>;

    async fn send_message(
        &self,
        peer: &PeerHandle,
        body: &FormattedText,
        link_preview: bool,
    ) -> TransportResult<SentMessage>;

    async fn send_media(&self, peer: &PeerHandle, item: &MediaItem) -> TransportResult<SentMessage>;

    async fn send_album(&self, peer: &PeerHandle, items: &[MediaItem]) -> TransportResult<Vec<SentMessage>>;

    async fn pin_message(&self, peer: &PeerHandle, message_id: i64) -> TransportResult<()>;

    async fn delete_messages(&self, peer: &PeerHandle, ids: &[i64]) -> TransportResult<()>;

    /// Stream of new-message and deleted events for `peer`.
    ///
    /// The stream ends when the session drops the subscription.
    async fn subscribe(&self, peer: &PeerHandle) -> TransportResult<mpsc::Receiver<SourceEvent>>;

    /// Close the session; best-effort
    async fn disconnect(&self);
}

/// Opens transport sessions for bot identities
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, bot: &BotIdentity) -> TransportResult<Arc<dyn Transport>>;
}

/// Live sessions keyed by bot id
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<BotId, Arc<dyn Transport>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, transport: Arc<dyn Transport>) {
        self.sessions.write().await.insert(transport.bot_id(), transport);
    }

    pub async fn get(&self, bot_id: BotId) -> Option<Arc<dyn Transport>> {
        self.sessions.read().await.get(&bot_id).cloned()
    }

    /// Bot ids with a live session, ascending
    pub async fn bot_ids(&self) -> Vec<BotId> {
        let mut ids: Vec<BotId> = self.sessions.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Remove and disconnect every session
    pub async fn disconnect_all(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().collect();
        for (bot_id, transport) in sessions {
            transport.disconnect().await;
            tracing::info!(bot_id, "Session closed");
        }
    }
}
