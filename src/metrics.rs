//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Change delivery and feed lifecycle
//! - Reconnect behavior
//! - Fan-out buffer pressure
//! - Replication throughput and failures
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record changes delivered to a consumer.
pub fn record_changes_delivered(count: usize) {
    counter!("replication_changes_delivered_total").increment(count as u64);
}

/// Record a feed interruption.
pub fn record_feed_interrupted() {
    counter!("replication_feed_interruptions_total").increment(1);
}

/// Record a reconnect attempt after an interruption.
pub fn record_reconnect_attempt() {
    counter!("replication_reconnect_attempts_total").increment(1);
}

/// Record the current lifecycle state of a listener or feed.
pub fn set_consumer_state(component: &'static str, state: &str) {
    gauge!("replication_consumer_state", "component" => component, "state" => state.to_string())
        .set(1.0);
}

/// Record a change dispatched to fan-out subscribers.
pub fn record_fanout_dispatch(subscribers: usize) {
    counter!("replication_fanout_dispatches_total").increment(subscribers as u64);
}

/// Record an eviction from the fan-out ring buffer.
pub fn record_buffer_evicted() {
    counter!("replication_buffer_evictions_total").increment(1);
}

/// Record documents read from a replication source.
pub fn record_docs_read(direction: &str, count: u64) {
    counter!("replication_docs_read_total", "direction" => direction.to_string()).increment(count);
}

/// Record documents written to a replication target.
pub fn record_docs_written(direction: &str, count: u64) {
    counter!("replication_docs_written_total", "direction" => direction.to_string())
        .increment(count);
}

/// Record per-document write failures.
pub fn record_write_failures(direction: &str, count: u64) {
    if count > 0 {
        counter!("replication_doc_write_failures_total", "direction" => direction.to_string())
            .increment(count);
    }
}

/// Record conflicts routed to the conflict resolver.
pub fn record_conflicts(direction: &str, count: u64) {
    if count > 0 {
        counter!("replication_conflicts_total", "direction" => direction.to_string())
            .increment(count);
    }
}

/// Record the wall-clock duration of a replication run.
pub fn record_replication_duration(direction: &str, duration: Duration) {
    histogram!("replication_run_duration_seconds", "direction" => direction.to_string())
        .record(duration.as_secs_f64());
}
