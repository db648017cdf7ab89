//! Content composition
//!
//! Turns the raw message history of a source channel into its canonical
//! feed of [`Post`]s, picks the post to publish for a trigger, and renders
//! it into an outgoing [`Rendered`] value.
//!
//! - [`text`] - UTF-16 length, slicing, entity clipping and suffix injection
//! - [`markup`] - inline markup parser for channel suffixes
//! - [`render`] - tagged outgoing variants

pub mod markup;
pub mod render;
pub mod text;

use std::collections::BTreeMap;

use rand::seq::SliceRandom;

use crate::models::{ChoiceMode, Post, RawMessage};
use crate::transport::{PeerHandle, Transport, TransportError};

pub use render::{MediaFile, MediaItem, Rendered};
pub use text::{FormattedText, MAX_CAPTION_LEN, MAX_TEXT_LEN};

/// Default number of most recent messages fetched per source
pub const DEFAULT_FETCH_LIMIT: usize = 5000;

/// Content errors; never retried
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComposeError {
    #[error("source has no publishable posts")]
    NoPosts,

    #[error("message {message_id} has nothing that can be sent")]
    NothingToSend { message_id: i64 },
}

/// Group raw messages into posts.
///
/// Service messages and messages without text or media are dropped,
/// album members are grouped by album id and ordered by (date, id), and
/// the resulting list is ordered by each post's first member.
pub fn build_posts<I>(messages: I) -> Vec<Post>
where
    I: IntoIterator<Item = RawMessage>,
{
    let mut albums: BTreeMap<i64, Vec<RawMessage>> = BTreeMap::new();
    let mut singles = Vec::new();

    for msg in messages.into_iter().filter(RawMessage::has_content) {
        match msg.grouped_id {
            Some(gid) => albums.entry(gid).or_default().push(msg),
            None => singles.push(msg),
        }
    }

    let mut posts: Vec<Post> = singles
        .into_iter()
        .map(|m| vec![m])
        .chain(albums.into_values())
        .filter_map(Post::new)
        .collect();

    posts.sort_by_key(Post::sort_key);
    posts
}

/// Pick the post to publish.
///
/// `last_published` is the first-member id of the post this task published
/// last; only `Sequential` uses it.
pub fn select_post(
    posts: &[Post],
    mode: ChoiceMode,
    last_published: Option<i64>,
) -> Result<&Post, ComposeError> {
    let first = posts.first().ok_or(ComposeError::NoPosts)?;

    let chosen = match mode {
        ChoiceMode::Random => posts.choose(&mut rand::thread_rng()).unwrap_or(first),
        ChoiceMode::First => first,
        ChoiceMode::Sequential => last_published
            .and_then(|last| posts.iter().find(|p| p.first().id > last))
            .unwrap_or(first),
    };

    Ok(chosen)
}

/// Fetches and shapes source content
#[derive(Debug, Clone)]
pub struct ContentComposer {
    fetch_limit: usize,
}

impl Default for ContentComposer {
    fn default() -> Self {
        Self::new(DEFAULT_FETCH_LIMIT)
    }
}

impl ContentComposer {
    pub fn new(fetch_limit: usize) -> Self {
        Self { fetch_limit }
    }

    pub fn fetch_limit(&self) -> usize {
        self.fetch_limit
    }

    /// Fetch the most recent messages of `peer` and build its feed
    pub async fn fetch_posts(
        &self,
        transport: &dyn Transport,
        peer: &PeerHandle,
    ) -> Result<Vec<Post>, TransportError> {
        let messages = transport.iterate_messages(peer, self.fetch_limit).await?;
        let fetched = messages.len();
        let posts = build_posts(messages);

        tracing::debug!(
            peer = peer.id,
            fetched,
            posts = posts.len(),
            "Built source feed"
        );
        Ok(posts)
    }

    pub fn render(&self, post: &Post, suffix: Option<&str>) -> Result<Rendered, ComposeError> {
        render::render(post, suffix)
    }
}
