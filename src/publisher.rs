//! Sending rendered posts and applying post-publish policy
//!
//! Albums are sent as one batch; if the batch is refused the items are sent
//! one by one with a short pause between them, skipping items that fail.
//! Pinning and source deletion run only after a confirmed send and are
//! best-effort: their failures are logged and never fail the publication.

use std::time::Duration;

use serde::Serialize;

use crate::compose::{ComposeError, MediaItem, Rendered};
use crate::models::{BotId, ChannelId, TaskId};
use crate::resolver::ResolveError;
use crate::storage::StorageError;
use crate::transport::{PeerHandle, Transport, TransportError};

/// Default pause between individually sent album items
pub const DEFAULT_ALBUM_PACING: Duration = Duration::from_millis(300);

/// Failure anywhere on the publish path
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("task {task_id} not found")]
    TaskMissing { task_id: TaskId },

    #[error("task {task_id} is disabled")]
    TaskInactive { task_id: TaskId },

    #[error("task {task_id} references unknown channel {channel_id}")]
    ChannelMissing { task_id: TaskId, channel_id: ChannelId },

    #[error("no live session for bot {bot_id}")]
    NoSession { bot_id: BotId },

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("send failed: {0}")]
    Transport(#[from] TransportError),

    #[error("metadata unavailable: {0}")]
    Storage(#[from] StorageError),

    #[error("publish job for task {task_id} panicked")]
    Panicked { task_id: TaskId },
}

impl PublishError {
    /// Whether the failure belongs in the retry queue.
    ///
    /// Content problems and broken task wiring would fail identically on
    /// the next sweep.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::TaskMissing { .. }
                | Self::TaskInactive { .. }
                | Self::ChannelMissing { .. }
                | Self::NoSession { .. }
                | Self::Compose(_)
        )
    }

    /// Label used for the publish outcome metric
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskMissing { .. } | Self::TaskInactive { .. } | Self::ChannelMissing { .. } => "invalid_task",
            Self::NoSession { .. } => "no_session",
            Self::Compose(_) => "no_content",
            Self::Resolve(_) => "resolve_failed",
            Self::Transport(_) => "send_failed",
            Self::Storage(_) => "storage_failed",
            Self::Panicked { .. } => "panicked",
        }
    }
}

/// What to do after a confirmed send
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishPolicy {
    /// Pin the first sent message in the target
    pub pin: bool,

    /// Delete the published messages from the source
    pub delete_source: bool,
}

/// Result of a publication
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Delivery {
    /// Ids of the messages created in the target
    pub sent_ids: Vec<i64>,

    /// Album was delivered item by item
    pub fallback: bool,

    pub pinned: bool,

    pub source_deleted: bool,
}

/// Sends rendered posts through a transport session
#[derive(Debug, Clone)]
pub struct Publisher {
    album_pacing: Duration,
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new(DEFAULT_ALBUM_PACING)
    }
}

impl Publisher {
    pub fn new(album_pacing: Duration) -> Self {
        Self { album_pacing }
    }

    /// Send `rendered` to `target`, then apply `policy`.
    ///
    /// `source_ids` are the source messages the post was built from; they
    /// are deleted from `source` when the policy asks for it.
    pub async fn publish(
        &self,
        transport: &dyn Transport,
        target: &PeerHandle,
        rendered: &Rendered,
        source: &PeerHandle,
        source_ids: &[i64],
        policy: PublishPolicy,
    ) -> Result<Delivery, PublishError> {
        let mut delivery = self.send(transport, target, rendered).await?;

        if policy.pin {
            if let Some(&first) = delivery.sent_ids.first() {
                match transport.pin_message(target, first).await {
                    Ok(()) => delivery.pinned = true,
                    Err(e) => tracing::warn!(
                        target = target.id,
                        message_id = first,
                        error = %e,
                        "Pin failed"
                    ),
                }
            }
        }

        if policy.delete_source && !source_ids.is_empty() {
            match transport.delete_messages(source, source_ids).await {
                Ok(()) => delivery.source_deleted = true,
                Err(e) => tracing::warn!(
                    source = source.id,
                    ids = ?source_ids,
                    error = %e,
                    "Source deletion failed"
                ),
            }
        }

        Ok(delivery)
    }

    /// Send `rendered` without applying any policy
    pub async fn send(
        &self,
        transport: &dyn Transport,
        target: &PeerHandle,
        rendered: &Rendered,
    ) -> Result<Delivery, PublishError> {
        let delivery = match rendered {
            Rendered::Text { body, link_preview } => {
                let sent = transport.send_message(target, body, *link_preview).await?;
                Delivery::sent(vec![sent.id])
            }
            Rendered::WebPreview { body, .. } => {
                let sent = transport.send_message(target, body, true).await?;
                Delivery::sent(vec![sent.id])
            }
            Rendered::Photo(item) | Rendered::Document(item) => {
                let sent = transport.send_media(target, item).await?;
                Delivery::sent(vec![sent.id])
            }
            Rendered::Album { items } => self.send_album(transport, target, items).await?,
        };

        tracing::debug!(
            target = target.id,
            variant = rendered.variant_name(),
            sent = ?delivery.sent_ids,
            "Post sent"
        );
        Ok(delivery)
    }

    async fn send_album(
        &self,
        transport: &dyn Transport,
        target: &PeerHandle,
        items: &[MediaItem],
    ) -> Result<Delivery, PublishError> {
        let batch_error = match transport.send_album(target, items).await {
            Ok(sent) => return Ok(Delivery::sent(sent.into_iter().map(|m| m.id).collect())),
            Err(e) => e,
        };

        tracing::warn!(
            target = target.id,
            items = items.len(),
            error = %batch_error,
            "Album send failed, sending items individually"
        );

        let mut sent_ids = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.album_pacing).await;
            }
            match transport.send_media(target, item).await {
                Ok(sent) => sent_ids.push(sent.id),
                Err(e) => tracing::warn!(
                    target = target.id,
                    item = i,
                    file_id = item.file.file_id(),
                    error = %e,
                    "Album item failed, skipping"
                ),
            }
        }

        if sent_ids.is_empty() {
            return Err(PublishError::Transport(batch_error));
        }

        Ok(Delivery {
            sent_ids,
            fallback: true,
            ..Default::default()
        })
    }
}

impl Delivery {
    fn sent(sent_ids: Vec<i64>) -> Self {
        Self {
            sent_ids,
            ..Default::default()
        }
    }
}
