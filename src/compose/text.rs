//! UTF-16 text arithmetic for formatted messages
//!
//! Entity offsets, lengths and message limits are all measured in UTF-16
//! code units. Characters outside the Basic Multilingual Plane take two
//! units, so every cut in this module is made on a `char` boundary and a
//! surrogate pair is never split.

use serde::{Deserialize, Serialize};

use crate::models::MessageEntity;

use super::markup;

/// Maximum length of a plain text message
pub const MAX_TEXT_LEN: usize = 4096;

/// Maximum length of a media caption
pub const MAX_CAPTION_LEN: usize = 2048;

/// Separator placed between base content and the suffix
pub const SUFFIX_SEPARATOR: &str = "\n";

/// Length of `s` in UTF-16 code units
pub fn len16(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Longest prefix of `s` that fits in `budget` UTF-16 units.
///
/// When the budget ends inside a surrogate pair the whole pair is left out,
/// so the result can be one unit shorter than `budget`.
pub fn slice16(s: &str, budget: usize) -> &str {
    let mut used = 0;
    for (idx, ch) in s.char_indices() {
        let w = ch.len_utf16();
        if used + w > budget {
            return &s[..idx];
        }
        used += w;
    }
    s
}

/// Drop entities outside `[0, max)` and shorten the ones crossing `max`
pub fn clip_entities(entities: &[MessageEntity], max: usize) -> Vec<MessageEntity> {
    entities.iter().filter_map(|e| e.clipped(max)).collect()
}

/// Text with its formatting entities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedText {
    pub text: String,
    pub entities: Vec<MessageEntity>,
}

impl FormattedText {
    pub fn new(text: impl Into<String>, entities: Vec<MessageEntity>) -> Self {
        Self {
            text: text.into(),
            entities,
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self::new(text, Vec::new())
    }

    pub fn len16(&self) -> usize {
        len16(&self.text)
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Clip every entity against the current text length
    pub fn normalized(mut self) -> Self {
        let max = self.len16();
        self.entities = clip_entities(&self.entities, max);
        self
    }

    /// Cut to at most `budget` UTF-16 units, clipping entities to the cut
    pub fn truncated(&self, budget: usize) -> Self {
        let text = slice16(&self.text, budget).to_string();
        let max = len16(&text);
        Self {
            entities: clip_entities(&self.entities, max),
            text,
        }
    }
}

/// Append a marked-up `suffix` to `base` within `limit` UTF-16 units.
///
/// The base text and its entities are never modified. When the combined
/// text is too long only the suffix is cut; when nothing of the suffix fits
/// the separator is omitted as well. `suffix = None` returns the base
/// unchanged apart from entity clipping.
pub fn append_suffix(base: FormattedText, suffix: Option<&str>, limit: usize) -> FormattedText {
    let Some(raw) = suffix.filter(|s| !s.is_empty()) else {
        return base.normalized();
    };

    let parsed = markup::parse(raw);
    if parsed.is_empty() {
        return base.normalized();
    }

    let sep = if base.is_empty() { "" } else { SUFFIX_SEPARATOR };
    let head16 = base.len16() + len16(sep);
    let total16 = head16 + parsed.len16();

    let tail = if total16 > limit {
        if head16 >= limit {
            tracing::debug!(
                base_len = base.len16(),
                limit,
                "No room left for suffix"
            );
            return base.normalized();
        }
        parsed.truncated(limit - head16)
    } else {
        parsed
    };

    if tail.is_empty() {
        return base.normalized();
    }

    let FormattedText { mut text, mut entities } = base;
    text.push_str(sep);
    text.push_str(&tail.text);
    entities.extend(tail.entities.iter().map(|e| e.shifted(head16)));

    FormattedText { text, entities }.normalized()
}
