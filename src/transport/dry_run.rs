//! Read-only transport wrapper
//!
//! Reads go to the wrapped session; sends, pins and deletes are only logged.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::compose::{FormattedText, MediaItem};
use crate::models::{BotId, BotIdentity, RawMessage};

use super::{PeerHandle, SentMessage, SourceEvent, Transport, TransportFactory, TransportResult};

/// Wraps a transport and suppresses every write
pub struct DryRunTransport {
    inner: Arc<dyn Transport>,
    next_id: AtomicI64,
}

impl DryRunTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self {
            inner,
            next_id: AtomicI64::new(1),
        }
    }

    fn fake_id(&self) -> SentMessage {
        SentMessage {
            id: -self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Transport for DryRunTransport {
    fn bot_id(&self) -> BotId {
        self.inner.bot_id()
    }

    async fn resolve_by_id(&self, id: i64) -> TransportResult<PeerHandle> {
        self.inner.resolve_by_id(id).await
    }

    async fn resolve_by_username(&self, username: &str) -> TransportResult<PeerHandle> {
        self.inner.resolve_by_username(username).await
    }

    async fn dialogs(&self) -> TransportResult<Vec<PeerHandle>> {
        self.inner.dialogs().await
    }

    async fn iterate_messages(&self, peer: &PeerHandle, limit: usize) -> TransportResult<Vec<RawMessage>> {
        self.inner.iterate_messages(peer, limit).await
    }

    async fn send_message(
        &self,
        peer: &PeerHandle,
        body: &FormattedText,
        link_preview: bool,
    ) -> TransportResult<SentMessage> {
        tracing::info!(
            bot_id = self.bot_id(),
            peer = peer.id,
            chars = body.len16(),
            link_preview,
            "[dry-run] send text"
        );
        Ok(self.fake_id())
    }

    async fn send_media(&self, peer: &PeerHandle, item: &MediaItem) -> TransportResult<SentMessage> {
        tracing::info!(
            bot_id = self.bot_id(),
            peer = peer.id,
            file = item.file.file_id(),
            "[dry-run] send media"
        );
        Ok(self.fake_id())
    }

    async fn send_album(&self, peer: &PeerHandle, items: &[MediaItem]) -> TransportResult<Vec<SentMessage>> {
        tracing::info!(
            bot_id = self.bot_id(),
            peer = peer.id,
            items = items.len(),
            "[dry-run] send album"
        );
        Ok(items.iter().map(|_| self.fake_id()).collect())
    }

    async fn pin_message(&self, peer: &PeerHandle, message_id: i64) -> TransportResult<()> {
        tracing::info!(bot_id = self.bot_id(), peer = peer.id, message_id, "[dry-run] pin");
        Ok(())
    }

    async fn delete_messages(&self, peer: &PeerHandle, ids: &[i64]) -> TransportResult<()> {
        tracing::info!(bot_id = self.bot_id(), peer = peer.id, ids = ?ids, "[dry-run] delete");
        Ok(())
    }

    async fn subscribe(&self, peer: &PeerHandle) -> TransportResult<mpsc::Receiver<SourceEvent>> {
        self.inner.subscribe(peer).await
    }

    async fn disconnect(&self) {
        self.inner.disconnect().await
    }
}

/// Factory wrapping every session in a [`DryRunTransport`]
pub struct DryRunFactory<F> {
    inner: F,
}

impl<F: TransportFactory> DryRunFactory<F> {
    pub fn new(inner: F) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<F: TransportFactory> TransportFactory for DryRunFactory<F> {
    async fn connect(&self, bot: &BotIdentity) -> TransportResult<Arc<dyn Transport>> {
        let inner = self.inner.connect(bot).await?;
        Ok(Arc::new(DryRunTransport::new(inner)))
    }
}
