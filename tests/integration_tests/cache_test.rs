//! Cache coherence tests

use std::time::Duration;

use postrelay::engine::JobOutcome;
use postrelay::listener::ChangeEvent;
use postrelay::transport::memory::{Op, Sent};

use crate::common::*;

/// Let the feed pump drain pending events
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn sent_texts(h: &Harness) -> Vec<String> {
    h.transport
        .sent()
        .into_iter()
        .filter_map(|s| match s {
            Sent::Text { body, .. } => Some(body.text),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_notification_invalidates_both_caches() {
    let h = Harness::new(vec![task(1, &[WEDNESDAY_NOON])], vec![text_msg(1, "one")]).await;
    h.engine.publish_now(1, BOT).await;
    assert!(h.engine.metadata().is_loaded().await);
    assert!(!h.engine.content().is_empty().await);

    let event = ChangeEvent::from_payload(r#"{"table":"api_task","op":"UPDATE","id":1}"#);
    h.engine.handle_change(&event).await;

    assert!(!h.engine.metadata().is_loaded().await);
    assert!(h.engine.content().is_empty().await);
}

#[tokio::test]
async fn test_next_tick_reloads_after_notification() {
    let h = Harness::new(vec![task(1, &[WEDNESDAY_NOON])], vec![]).await;
    let loads = h.store.task_loads();

    // slot edited while the old snapshot is cached
    h.store.put_task(task(1, &[(2, 46_800)]));
    h.engine
        .handle_change(&ChangeEvent::from_payload(r#"{"table":"api_timeslot","op":"INSERT","id":9}"#))
        .await;

    let due = h.engine.scheduler(BOT).evaluate(wednesday(13, 0, 5)).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(h.store.task_loads(), loads + 1);
}

#[tokio::test]
async fn test_malformed_notification_still_invalidates() {
    let h = Harness::new(vec![task(1, &[WEDNESDAY_NOON])], vec![]).await;
    h.engine.metadata().snapshot().await.unwrap();

    let event = ChangeEvent::from_payload("not json");
    assert!(event.notification.is_none());
    h.engine.handle_change(&event).await;

    assert!(!h.engine.metadata().is_loaded().await);
}

#[tokio::test]
async fn test_new_source_message_reaches_cached_feed() {
    let h = Harness::new(vec![task(1, &[WEDNESDAY_NOON])], vec![]).await;

    // empty feed is cached and subscribed
    assert!(matches!(h.engine.publish_now(1, BOT).await, JobOutcome::Skipped { .. }));
    assert_eq!(h.transport.subscriber_count(SOURCE_PEER), 1);

    h.transport.push_message(SOURCE_PEER, text_msg(5, "fresh"));
    settle().await;

    assert!(matches!(h.engine.publish_now(1, BOT).await, JobOutcome::Published { .. }));
    assert_eq!(sent_texts(&h), vec!["fresh"]);
    assert_eq!(h.transport.calls(Op::Iterate), 1);
}

#[tokio::test]
async fn test_deleted_source_message_leaves_cached_feed() {
    let h = Harness::new(
        vec![task(1, &[WEDNESDAY_NOON])],
        vec![text_msg(1, "one"), text_msg(2, "two")],
    )
    .await;
    h.engine.publish_now(1, BOT).await;

    h.transport.remove_messages(SOURCE_PEER, &[1]);
    settle().await;

    h.engine.publish_now(1, BOT).await;
    assert_eq!(sent_texts(&h), vec!["one", "two"]);
    assert_eq!(h.transport.calls(Op::Iterate), 1);
}

#[tokio::test]
async fn test_freshness_check_reloads_missing_snapshot() {
    let h = Harness::new(vec![task(1, &[WEDNESDAY_NOON])], vec![]).await;
    h.engine.metadata().invalidate().await;

    h.engine.check_freshness().await;
    assert!(h.engine.metadata().is_loaded().await);
}
