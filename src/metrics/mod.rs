//! Prometheus metrics for the publication engine
//!
//! This module provides metrics tracking for:
//! - Scheduling: triggers per bot, dedup suppressions
//! - Publishing: outcomes, duration, retry queue depth, dead letters
//! - Caches: hits and misses per cache, invalidations
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for scheduling and publishing metrics
struct EngineMetrics {
    triggers: CounterVec,
    dedup_suppressed: Counter,
    publish: CounterVec,
    publish_duration: Histogram,
    retry_queue_size: Gauge,
    dead_letters: Counter,
}

/// Container for cache metrics
struct CacheMetrics {
    requests: CounterVec,
    invalidations: Counter,
}

static ENGINE_METRICS: OnceLock<EngineMetrics> = OnceLock::new();

static CACHE_METRICS: OnceLock<CacheMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Call once at startup. If registration fails, subsequent metric
/// operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = postrelay::metrics::init_metrics() {
///     tracing::warn!(error = %e, "Metrics disabled");
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    // Prevent double initialization
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let engine = EngineMetrics {
        triggers: register_counter_vec!(
            "postrelay_triggers_total",
            "Scheduler triggers by bot",
            &["bot"]
        )?,
        dedup_suppressed: register_counter!(
            "postrelay_dedup_suppressed_total",
            "Triggers suppressed by the dedup guard"
        )?,
        publish: register_counter_vec!(
            "postrelay_publish_total",
            "Publish attempts by outcome",
            &["outcome"]
        )?,
        publish_duration: register_histogram!(
            "postrelay_publish_duration_seconds",
            "Duration of the publish path in seconds",
            vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
        )?,
        retry_queue_size: register_gauge!(
            "postrelay_retry_queue_size",
            "Entries waiting for the retry sweep"
        )?,
        dead_letters: register_counter!(
            "postrelay_retry_dead_letter_total",
            "Retry entries dropped after reaching the attempt cap"
        )?,
    };

    let cache = CacheMetrics {
        requests: register_counter_vec!(
            "postrelay_cache_requests_total",
            "Cache lookups by cache and result",
            &["cache", "result"]
        )?,
        invalidations: register_counter!(
            "postrelay_cache_invalidations_total",
            "Cache invalidations caused by change notifications"
        )?,
    };

    ENGINE_METRICS.set(engine).ok();
    CACHE_METRICS.set(cache).ok();

    Ok(())
}

/// Check if metrics are initialized
pub fn metrics_initialized() -> bool {
    ENGINE_METRICS.get().is_some() && CACHE_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a scheduler trigger
pub fn record_trigger(bot_id: i64) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.triggers.with_label_values(&[&bot_id.to_string()]).inc();
    }
}

/// Record a trigger suppressed by the dedup guard
pub fn record_dedup_suppressed() {
    if let Some(m) = ENGINE_METRICS.get() {
        m.dedup_suppressed.inc();
    }
}

/// Record the outcome of a publish attempt
pub fn record_publish(outcome: &str) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.publish.with_label_values(&[outcome]).inc();
    }
}

/// Update the retry queue depth
pub fn set_retry_queue_size(size: usize) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.retry_queue_size.set(size as f64);
    }
}

/// Record a dead-lettered retry entry
pub fn record_dead_letter() {
    if let Some(m) = ENGINE_METRICS.get() {
        m.dead_letters.inc();
    }
}

/// Record a cache lookup
pub fn record_cache_request(cache: &str, hit: bool) {
    if let Some(m) = CACHE_METRICS.get() {
        let result = if hit { "hit" } else { "miss" };
        m.requests.with_label_values(&[cache, result]).inc();
    }
}

/// Record a cache invalidation
pub fn record_cache_invalidation() {
    if let Some(m) = CACHE_METRICS.get() {
        m.invalidations.inc();
    }
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start timing one run of the publish path
pub fn start_publish_timer() -> MetricsTimer {
    match ENGINE_METRICS.get() {
        Some(m) => MetricsTimer::new(m.publish_duration.start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================
