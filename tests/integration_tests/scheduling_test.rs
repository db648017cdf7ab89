//! Scheduler pass tests

use std::sync::Mutex;
use std::time::Duration;

use postrelay::engine::JobOutcome;
use postrelay::scheduler::{Trigger, TriggerSink};

use crate::common::*;

/// Records dispatched triggers instead of publishing them
#[derive(Default)]
struct CollectingSink {
    dispatched: Mutex<Vec<(Trigger, Duration)>>,
}

impl TriggerSink for CollectingSink {
    fn dispatch(&self, trigger: Trigger, delay: Duration) {
        self.dispatched.lock().unwrap().push((trigger, delay));
    }
}

// ============================================================================
// Slot Matching
// ============================================================================

#[tokio::test]
async fn test_wednesday_noon_triggers_within_tolerance() {
    let h = Harness::new(vec![task(1, &[WEDNESDAY_NOON])], vec![text_msg(1, "hello")]).await;
    let scheduler = h.engine.scheduler(BOT);

    let due = scheduler.evaluate(wednesday(12, 0, 20)).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].task_id, 1);
    assert_eq!(due[0].bot_id, BOT);
}

#[tokio::test]
async fn test_outside_tolerance_does_not_trigger() {
    let h = Harness::new(vec![task(1, &[WEDNESDAY_NOON])], vec![]).await;
    let scheduler = h.engine.scheduler(BOT);

    assert!(scheduler.evaluate(wednesday(12, 0, 40)).await.unwrap().is_empty());
    assert!(scheduler.evaluate(wednesday(11, 59, 30)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_disabled_tasks_never_trigger() {
    let mut paused = task(1, &[WEDNESDAY_NOON]);
    paused.is_active = false;
    let mut globally_off = task(2, &[WEDNESDAY_NOON]);
    globally_off.is_global_active = false;
    let mut foreign = task(3, &[WEDNESDAY_NOON]);
    foreign.bot_id = BOT + 1;

    let h = Harness::new(vec![paused, globally_off, foreign], vec![]).await;
    let due = h.engine.scheduler(BOT).evaluate(wednesday(12, 0, 0)).await.unwrap();
    assert!(due.is_empty());
}

// ============================================================================
// Dedup
// ============================================================================

#[tokio::test]
async fn test_duplicate_trigger_within_window_suppressed() {
    // second slot lands 61s after the first
    let h = Harness::new(vec![task(1, &[WEDNESDAY_NOON, (2, 43_261)])], vec![]).await;
    let scheduler = h.engine.scheduler(BOT);

    assert_eq!(scheduler.evaluate(wednesday(12, 0, 0)).await.unwrap().len(), 1);
    assert!(scheduler.evaluate(wednesday(12, 0, 20)).await.unwrap().is_empty());
    assert_eq!(scheduler.evaluate(wednesday(12, 1, 1)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_dedup_is_shared_between_schedulers() {
    let h = Harness::new(vec![task(1, &[WEDNESDAY_NOON])], vec![]).await;

    let first = h.engine.scheduler(BOT).evaluate(wednesday(12, 0, 0)).await.unwrap();
    let second = h.engine.scheduler(BOT).evaluate(wednesday(12, 0, 5)).await.unwrap();
    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_tick_staggers_dispatch() {
    let mut config = test_config();
    config.scheduler.stagger_secs = 2;
    let tasks = vec![task(1, &[WEDNESDAY_NOON]), task(2, &[WEDNESDAY_NOON])];
    let h = Harness::build(config, tasks, None, vec![]).await;

    let sink = CollectingSink::default();
    let count = h.engine.scheduler(BOT).tick(&sink, wednesday(12, 0, 10)).await;
    assert_eq!(count, 2);

    let dispatched = sink.dispatched.lock().unwrap();
    let mut delays: Vec<_> = dispatched.iter().map(|(_, d)| d.as_secs()).collect();
    delays.sort_unstable();
    assert_eq!(delays, vec![2, 4]);
}

#[tokio::test]
async fn test_tick_survives_store_outage() {
    let h = Harness::new(vec![task(1, &[WEDNESDAY_NOON])], vec![]).await;
    h.engine.metadata().invalidate().await;
    h.store.set_failing(true);

    let sink = CollectingSink::default();
    assert_eq!(h.engine.scheduler(BOT).tick(&sink, wednesday(12, 0, 0)).await, 0);

    h.store.set_failing(false);
    assert_eq!(h.engine.scheduler(BOT).tick(&sink, wednesday(12, 0, 1)).await, 1);
}

#[tokio::test]
async fn test_triggered_task_publishes() {
    let h = Harness::new(vec![task(1, &[WEDNESDAY_NOON])], vec![text_msg(1, "hello")]).await;

    let due = h.engine.scheduler(BOT).evaluate(wednesday(12, 0, 0)).await.unwrap();
    for trigger in due {
        let outcome = h.engine.publish_now(trigger.task_id, trigger.bot_id).await;
        assert!(matches!(outcome, JobOutcome::Published { .. }));
    }
    assert_eq!(h.transport.sent().len(), 1);
}
