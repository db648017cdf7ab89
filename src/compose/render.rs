//! Outgoing representation of a selected post
//!
//! Every source message maps to exactly one variant of [`Rendered`] through
//! an explicit conversion; the transport never inspects raw media.

use serde::{Deserialize, Serialize};

use crate::models::{Media, Post, RawMessage};

use super::text::{append_suffix, FormattedText, MAX_CAPTION_LEN, MAX_TEXT_LEN};
use super::ComposeError;

/// File to attach to an outgoing message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaFile {
    Photo { file_id: String },
    /// Image stored as a document; re-uploaded as a photo
    ImageDocument { file_id: String },
    Document { file_id: String },
}

impl MediaFile {
    /// Sendable file for `media`; link previews have none
    pub fn from_media(media: &Media) -> Option<Self> {
        match media {
            Media::Photo { file_id } => Some(Self::Photo {
                file_id: file_id.clone(),
            }),
            Media::Document { file_id, .. } if media.is_image_document() => {
                Some(Self::ImageDocument {
                    file_id: file_id.clone(),
                })
            }
            Media::Document { file_id, .. } | Media::Other { file_id } => Some(Self::Document {
                file_id: file_id.clone(),
            }),
            Media::WebPage { .. } => None,
        }
    }

    pub fn file_id(&self) -> &str {
        match self {
            Self::Photo { file_id } | Self::ImageDocument { file_id } | Self::Document { file_id } => {
                file_id
            }
        }
    }

    pub fn is_photo(&self) -> bool {
        matches!(self, Self::Photo { .. } | Self::ImageDocument { .. })
    }
}

/// One attachment with its caption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub file: MediaFile,
    pub caption: FormattedText,
}

/// Publishable form of a post
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum Rendered {
    Text {
        body: FormattedText,
        link_preview: bool,
    },
    Photo(MediaItem),
    Document(MediaItem),
    Album {
        items: Vec<MediaItem>,
    },
    /// Link-preview message re-sent as text with the preview enabled
    WebPreview {
        body: FormattedText,
        url: Option<String>,
    },
}

impl Rendered {
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Photo(_) => "photo",
            Self::Document(_) => "document",
            Self::Album { .. } => "album",
            Self::WebPreview { .. } => "web_preview",
        }
    }
}

/// Render `post`, appending `suffix` to the first sendable unit
pub fn render(post: &Post, suffix: Option<&str>) -> Result<Rendered, ComposeError> {
    if post.is_album() {
        render_album(post, suffix)
    } else {
        render_single(post.first(), suffix)
    }
}

fn base_text(msg: &RawMessage) -> FormattedText {
    FormattedText::new(msg.text.clone(), msg.entities.clone())
}

fn non_empty(body: FormattedText, msg: &RawMessage) -> Result<FormattedText, ComposeError> {
    if body.is_empty() {
        return Err(ComposeError::NothingToSend { message_id: msg.id });
    }
    Ok(body)
}

/// Single message conversion
pub fn render_single(msg: &RawMessage, suffix: Option<&str>) -> Result<Rendered, ComposeError> {
    match &msg.media {
        None => Ok(Rendered::Text {
            body: non_empty(append_suffix(base_text(msg), suffix, MAX_TEXT_LEN), msg)?,
            link_preview: msg.had_web_preview(),
        }),
        Some(Media::WebPage { url }) => Ok(Rendered::WebPreview {
            body: non_empty(append_suffix(base_text(msg), suffix, MAX_TEXT_LEN), msg)?,
            url: url.clone(),
        }),
        Some(media) => {
            let Some(file) = MediaFile::from_media(media) else {
                return Err(ComposeError::NothingToSend { message_id: msg.id });
            };
            let item = MediaItem {
                caption: append_suffix(base_text(msg), suffix, MAX_CAPTION_LEN),
                file,
            };
            if item.file.is_photo() {
                Ok(Rendered::Photo(item))
            } else {
                Ok(Rendered::Document(item))
            }
        }
    }
}

/// Album conversion; falls back to a text message built from the first
/// member when no attachment can be re-sent
pub fn render_album(post: &Post, suffix: Option<&str>) -> Result<Rendered, ComposeError> {
    let mut items = Vec::with_capacity(post.len());

    for msg in post.messages() {
        let Some(file) = msg.media.as_ref().and_then(MediaFile::from_media) else {
            continue;
        };
        let caption = if items.is_empty() {
            append_suffix(base_text(msg), suffix, MAX_CAPTION_LEN)
        } else {
            base_text(msg).normalized()
        };
        items.push(MediaItem { file, caption });
    }

    if items.is_empty() {
        let first = post.first();
        tracing::debug!(message_id = first.id, "Album has no sendable media, sending as text");
        return Ok(Rendered::Text {
            body: non_empty(append_suffix(base_text(first), suffix, MAX_TEXT_LEN), first)?,
            link_preview: true,
        });
    }

    Ok(Rendered::Album { items })
}
