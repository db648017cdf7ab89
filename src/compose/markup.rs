//! Lightweight inline markup used in channel suffixes
//!
//! Supported markers: `**bold**`, `__underline__`, `*italic*`,
//! `~~strike~~`, `` `code` `` and `[label](url)`. Markers do not nest; an
//! unclosed marker is kept as literal text.

use crate::models::{EntityKind, MessageEntity};

use super::text::{len16, FormattedText};

const MARKERS: [(&str, EntityKind); 5] = [
    ("**", EntityKind::Bold),
    ("__", EntityKind::Underline),
    ("*", EntityKind::Italic),
    ("~~", EntityKind::Strike),
    ("`", EntityKind::Code),
];

/// Parse `input` into clean text with entities (offsets in UTF-16 units)
pub fn parse(input: &str) -> FormattedText {
    let mut text = String::with_capacity(input.len());
    let mut entities = Vec::new();
    let mut rest = input;

    'outer: while !rest.is_empty() {
        if let Some((label, url, consumed)) = parse_link(rest) {
            push_span(&mut text, &mut entities, label, EntityKind::TextUrl { url: url.to_string() });
            rest = &rest[consumed..];
            continue;
        }

        for (marker, kind) in &MARKERS {
            if let Some(after) = rest.strip_prefix(marker) {
                if let Some(end) = after.find(marker) {
                    push_span(&mut text, &mut entities, &after[..end], kind.clone());
                    rest = &after[end + marker.len()..];
                    continue 'outer;
                }
                // unclosed: only the first marker that matches is tried
                break;
            }
        }

        let Some(ch) = rest.chars().next() else {
            break;
        };
        text.push(ch);
        rest = &rest[ch.len_utf8()..];
    }

    FormattedText { text, entities }
}

fn push_span(text: &mut String, entities: &mut Vec<MessageEntity>, inner: &str, kind: EntityKind) {
    let offset = len16(text);
    let length = len16(inner);
    text.push_str(inner);
    if length > 0 {
        entities.push(MessageEntity::new(kind, offset, length));
    }
}

/// `[label](url)` at the start of `s`: (label, url, bytes consumed)
fn parse_link(s: &str) -> Option<(&str, &str, usize)> {
    let body = s.strip_prefix('[')?;
    let close = body.find("](")?;
    let label = &body[..close];
    if label.contains('[') || label.contains('\n') {
        return None;
    }
    let after = &body[close + 2..];
    let end = after.find(')')?;
    let url = &after[..end];
    if url.is_empty() || url.contains(char::is_whitespace) {
        return None;
    }
    Some((label, url, 1 + close + 2 + end + 1))
}
