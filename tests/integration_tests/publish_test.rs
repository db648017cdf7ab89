//! Publish path tests

use postrelay::engine::JobOutcome;
use postrelay::models::{AfterPublish, ChoiceMode, EntityKind, Media};
use postrelay::transport::memory::{Op, Sent};
use postrelay::transport::TransportError;

use crate::common::*;

fn album_history() -> Vec<postrelay::RawMessage> {
    vec![
        photo_msg(1, "first shot", Some(77)),
        photo_msg(2, "", Some(77)),
        text_msg(3, "plain"),
    ]
}

// ============================================================================
// Content
// ============================================================================

#[tokio::test]
async fn test_text_post_gets_suffix() {
    let h = Harness::build(
        test_config(),
        vec![task(1, &[WEDNESDAY_NOON])],
        Some("via **source**"),
        vec![text_msg(1, "hello")],
    )
    .await;

    let outcome = h.engine.publish_now(1, BOT).await;
    assert!(matches!(outcome, JobOutcome::Published { .. }));

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Sent::Text { peer, body, link_preview } => {
            assert_eq!(*peer, TARGET_PEER);
            assert_eq!(body.text, "hello\nvia source");
            assert_eq!(body.entities.len(), 1);
            assert_eq!(body.entities[0].kind, EntityKind::Bold);
            assert_eq!(body.entities[0].offset, 10);
            assert!(!link_preview);
        }
        other => panic!("expected text, got {other:?}"),
    }
}

#[tokio::test]
async fn test_album_sent_as_one_batch() {
    let h = Harness::build(
        test_config(),
        vec![task(1, &[WEDNESDAY_NOON])],
        Some("tail"),
        album_history(),
    )
    .await;

    assert!(matches!(h.engine.publish_now(1, BOT).await, JobOutcome::Published { .. }));

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    let Sent::Album { items, .. } = &sent[0] else {
        panic!("expected album, got {:?}", sent[0]);
    };
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].file.file_id(), "photo-1");
    assert_eq!(items[0].caption.text, "first shot\ntail");
    assert_eq!(items[1].caption.text, "");
}

#[tokio::test]
async fn test_album_falls_back_to_single_sends() {
    let h = Harness::new(vec![task(1, &[WEDNESDAY_NOON])], album_history()).await;
    h.transport.fail_next(
        Op::SendAlbum,
        TransportError::Rpc {
            code: 400,
            message: "MEDIA_INVALID".into(),
        },
    );

    let outcome = h.engine.publish_now(1, BOT).await;
    let JobOutcome::Published { sent_ids } = outcome else {
        panic!("expected publish, got {outcome:?}");
    };
    assert_eq!(sent_ids.len(), 2);
    assert_eq!(h.transport.calls(Op::SendMedia), 2);
    assert!(h.transport.sent().iter().all(|s| matches!(s, Sent::Media { .. })));
}

#[tokio::test]
async fn test_web_preview_resent_as_text_with_preview() {
    let mut msg = text_msg(1, "https://example.com read this");
    msg.media = Some(Media::WebPage {
        url: Some("https://example.com".into()),
    });
    let h = Harness::new(vec![task(1, &[WEDNESDAY_NOON])], vec![msg]).await;

    assert!(matches!(h.engine.publish_now(1, BOT).await, JobOutcome::Published { .. }));
    match &h.transport.sent()[0] {
        Sent::Text { body, link_preview, .. } => {
            assert_eq!(body.text, "https://example.com read this");
            assert!(*link_preview);
        }
        other => panic!("expected text, got {other:?}"),
    }
}

// ============================================================================
// Selection and Policies
// ============================================================================

#[tokio::test]
async fn test_sequential_mode_walks_feed_and_wraps() {
    let mut t = task(1, &[WEDNESDAY_NOON]);
    t.choice_mode = ChoiceMode::Sequential;
    let history = vec![text_msg(1, "one"), text_msg(2, "two"), text_msg(3, "three")];
    let h = Harness::new(vec![t], history).await;

    let mut texts = Vec::new();
    for _ in 0..4 {
        h.engine.publish_now(1, BOT).await;
    }
    for sent in h.transport.sent() {
        if let Sent::Text { body, .. } = sent {
            texts.push(body.text);
        }
    }
    assert_eq!(texts, vec!["one", "two", "three", "one"]);
}

#[tokio::test]
async fn test_remove_policy_deletes_source_and_moves_on() {
    let mut t = task(1, &[WEDNESDAY_NOON]);
    t.after_publish = AfterPublish::Remove;
    let h = Harness::new(vec![t], vec![text_msg(1, "one"), text_msg(2, "two")]).await;

    h.engine.publish_now(1, BOT).await;
    assert_eq!(h.transport.deleted(), vec![(SOURCE_PEER, vec![1])]);

    // the deleted post must not come back from the cached feed
    h.engine.publish_now(1, BOT).await;
    let texts: Vec<_> = h
        .transport
        .sent()
        .into_iter()
        .filter_map(|s| match s {
            Sent::Text { body, .. } => Some(body.text),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["one", "two"]);
}

#[tokio::test]
async fn test_pin_after_publish() {
    let mut t = task(1, &[WEDNESDAY_NOON]);
    t.pin = true;
    let h = Harness::new(vec![t], vec![text_msg(1, "one")]).await;

    let JobOutcome::Published { sent_ids } = h.engine.publish_now(1, BOT).await else {
        panic!("expected publish");
    };
    assert_eq!(h.transport.pinned(), vec![(TARGET_PEER, sent_ids[0])]);
}

#[tokio::test]
async fn test_pin_failure_does_not_fail_publication() {
    let mut t = task(1, &[WEDNESDAY_NOON]);
    t.pin = true;
    let h = Harness::new(vec![t], vec![text_msg(1, "one")]).await;
    h.transport
        .fail_next(Op::Pin, TransportError::Unauthorized("CHAT_ADMIN_REQUIRED".into()));

    assert!(matches!(h.engine.publish_now(1, BOT).await, JobOutcome::Published { .. }));
    assert!(h.transport.pinned().is_empty());
    assert!(h.engine.retry_queue().is_empty().await);
}

#[tokio::test]
async fn test_publication_is_recorded() {
    let h = Harness::new(vec![task(1, &[WEDNESDAY_NOON])], album_history()).await;

    h.engine.publish_now(1, BOT).await;

    let records = h.store.publications();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].task_id, 1);
    assert_eq!(records[0].bot_id, BOT);
    assert_eq!(records[0].source_ids, vec![1, 2]);
    assert_eq!(records[0].sent_ids.len(), 2);
}
