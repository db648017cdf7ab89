//! Failure routing and retry sweep tests

use postrelay::engine::JobOutcome;
use postrelay::transport::memory::Op;
use postrelay::transport::TransportError;

use crate::common::*;

fn connection_lost() -> TransportError {
    TransportError::Connection("connection reset".into())
}

#[tokio::test]
async fn test_failed_send_is_queued_once() {
    let h = Harness::new(vec![task(1, &[WEDNESDAY_NOON])], vec![text_msg(1, "one")]).await;
    h.transport.fail_next(Op::SendMessage, connection_lost());
    h.transport.fail_next(Op::SendMessage, connection_lost());

    assert!(matches!(h.engine.publish_now(1, BOT).await, JobOutcome::Queued { .. }));
    assert!(matches!(h.engine.publish_now(1, BOT).await, JobOutcome::Queued { .. }));

    let entries = h.engine.retry_queue().entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!((entries[0].task_id, entries[0].bot_id), (1, BOT));
    assert_eq!(entries[0].attempts, 2);
}

#[tokio::test]
async fn test_successful_sweep_clears_entry() {
    let h = Harness::new(vec![task(1, &[WEDNESDAY_NOON])], vec![text_msg(1, "one")]).await;
    h.transport.fail_next(Op::SendMessage, TransportError::RateLimited { seconds: 3 });

    h.engine.publish_now(1, BOT).await;
    assert!(h.engine.retry_queue().contains(1, BOT).await);

    let report = h.engine.sweep_retries().await;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.published, 1);
    assert!(h.engine.retry_queue().is_empty().await);
    assert_eq!(h.transport.sent().len(), 1);
}

#[tokio::test]
async fn test_failed_sweep_requeues() {
    let h = Harness::new(vec![task(1, &[WEDNESDAY_NOON])], vec![text_msg(1, "one")]).await;
    h.transport.fail_next(Op::SendMessage, connection_lost());
    h.transport.fail_next(Op::SendMessage, connection_lost());

    h.engine.publish_now(1, BOT).await;
    let report = h.engine.sweep_retries().await;
    assert_eq!(report.requeued, 1);

    let entries = h.engine.retry_queue().entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attempts, 2);
}

#[tokio::test]
async fn test_attempt_cap_drops_entry() {
    let mut config = test_config();
    config.retry.max_attempts = Some(1);
    let h = Harness::build(config, vec![task(1, &[WEDNESDAY_NOON])], None, vec![text_msg(1, "one")]).await;
    h.transport.fail_next(Op::SendMessage, connection_lost());
    h.transport.fail_next(Op::SendMessage, connection_lost());

    h.engine.publish_now(1, BOT).await;
    assert_eq!(h.engine.retry_queue().len().await, 1);

    h.engine.sweep_retries().await;
    assert!(h.engine.retry_queue().is_empty().await);
}

#[tokio::test]
async fn test_source_fetch_failure_is_retryable() {
    let h = Harness::new(vec![task(1, &[WEDNESDAY_NOON])], vec![text_msg(1, "one")]).await;
    h.transport.fail_next(Op::Iterate, connection_lost());

    assert!(matches!(h.engine.publish_now(1, BOT).await, JobOutcome::Queued { .. }));
    assert_eq!(h.engine.sweep_retries().await.published, 1);
}

// ============================================================================
// Non-retryable Failures
// ============================================================================

#[tokio::test]
async fn test_missing_task_is_skipped() {
    let h = Harness::new(vec![], vec![text_msg(1, "one")]).await;

    assert!(matches!(h.engine.publish_now(42, BOT).await, JobOutcome::Skipped { .. }));
    assert!(h.engine.retry_queue().is_empty().await);
}

#[tokio::test]
async fn test_empty_source_is_skipped() {
    let h = Harness::new(vec![task(1, &[WEDNESDAY_NOON])], vec![]).await;

    assert!(matches!(h.engine.publish_now(1, BOT).await, JobOutcome::Skipped { .. }));
    assert!(h.engine.retry_queue().is_empty().await);
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn test_task_disabled_after_failure_leaves_queue() {
    let h = Harness::new(vec![task(1, &[WEDNESDAY_NOON])], vec![text_msg(1, "one")]).await;
    h.transport.fail_next(Op::SendMessage, connection_lost());
    h.engine.publish_now(1, BOT).await;

    let mut disabled = task(1, &[WEDNESDAY_NOON]);
    disabled.is_active = false;
    h.store.put_task(disabled);
    h.engine.metadata().invalidate().await;

    let report = h.engine.sweep_retries().await;
    assert_eq!(report.dropped, 1);
    assert!(h.engine.retry_queue().is_empty().await);
    assert!(h.transport.sent().is_empty());
}
