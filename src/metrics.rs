// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics through the `metrics` facade for:
//! - Publish throughput and failures
//! - Consumer-group reads, acks and processing failures
//! - Dead-letters by reason
//! - Reclaim sweeps
//! - Capture, replay and backfill outcomes
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `relay_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! The host installs the recorder/exporter; without one these calls are no-ops.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Broker
// =============================================================================

/// Record a publish attempt.
pub fn record_publish(topic: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("relay_publish_total", "topic" => topic.to_string(), "status" => status).increment(1);
}

/// Record a broker connection attempt.
pub fn record_broker_connection(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("relay_broker_connections_total", "status" => status).increment(1);
}

/// Record an XREADGROUP round trip.
pub fn record_stream_read(topic: &str, group: &str, entries: usize, duration: Duration) {
    counter!("relay_stream_reads_total", "topic" => topic.to_string(), "group" => group.to_string()).increment(1);
    if entries > 0 {
        counter!("relay_stream_entries_read_total", "topic" => topic.to_string(), "group" => group.to_string())
            .increment(entries as u64);
    }
    histogram!("relay_stream_read_duration_seconds", "topic" => topic.to_string())
        .record(duration.as_secs_f64());
}

/// Record a failed read (the loop backs off afterwards).
pub fn record_stream_read_error(topic: &str, group: &str) {
    counter!("relay_stream_read_errors_total", "topic" => topic.to_string(), "group" => group.to_string()).increment(1);
}

/// Current backoff applied by a read loop.
pub fn set_read_backoff(topic: &str, group: &str, delay: Duration) {
    gauge!("relay_read_backoff_seconds", "topic" => topic.to_string(), "group" => group.to_string())
        .set(delay.as_secs_f64());
}

/// Record the outcome of handing one message to a processor.
pub fn record_processed(topic: &str, group: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "relay_messages_processed_total",
        "topic" => topic.to_string(),
        "group" => group.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("relay_message_processing_duration_seconds", "topic" => topic.to_string())
        .record(duration.as_secs_f64());
}

/// Record an XACK.
pub fn record_ack(topic: &str, group: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "relay_acks_total",
        "topic" => topic.to_string(),
        "group" => group.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Gauge for active subscriptions.
pub fn set_active_subscriptions(count: usize) {
    gauge!("relay_active_subscriptions").set(count as f64);
}

// =============================================================================
// Dead letters
// =============================================================================

/// Record a dead-lettered message.
pub fn record_dead_letter(topic: &str, reason: &str) {
    counter!("relay_dead_letters_total", "topic" => topic.to_string(), "reason" => reason.to_string()).increment(1);
}

/// Record a dead-letter write that itself failed.
pub fn record_dead_letter_write_failure(sink: &str) {
    counter!("relay_dead_letter_write_failures_total", "sink" => sink.to_string()).increment(1);
}

/// Record a line appended to the abandoned file.
pub fn record_abandoned(reason: &str) {
    counter!("relay_abandoned_total", "reason" => reason.to_string()).increment(1);
}

// =============================================================================
// Reclaim
// =============================================================================

/// Record a completed reclaim sweep.
#[allow(clippy::too_many_arguments)]
pub fn record_reclaim_sweep(
    topic: &str,
    group: &str,
    scanned: usize,
    redelivered: usize,
    expired: usize,
    failed: usize,
    missing: usize,
    duration: Duration,
) {
    let topic = topic.to_string();
    let group = group.to_string();

    counter!("relay_reclaim_sweeps_total", "topic" => topic.clone(), "group" => group.clone()).increment(1);
    counter!("relay_reclaim_scanned_total", "topic" => topic.clone()).increment(scanned as u64);
    counter!("relay_reclaim_redelivered_total", "topic" => topic.clone()).increment(redelivered as u64);
    counter!("relay_reclaim_expired_total", "topic" => topic.clone()).increment(expired as u64);
    counter!("relay_reclaim_failed_total", "topic" => topic.clone()).increment(failed as u64);
    if missing > 0 {
        counter!("relay_reclaim_missing_total", "topic" => topic.clone()).increment(missing as u64);
    }
    histogram!("relay_reclaim_duration_seconds", "topic" => topic, "group" => group)
        .record(duration.as_secs_f64());
}

/// Record a sweep that did not run.
pub fn record_reclaim_skipped(reason: &str) {
    counter!("relay_reclaim_skipped_total", "reason" => reason.to_string()).increment(1);
}

/// Pending entries seen at the start of a sweep.
pub fn set_pending_entries(topic: &str, group: &str, count: u64) {
    gauge!("relay_pending_entries", "topic" => topic.to_string(), "group" => group.to_string()).set(count as f64);
}

// =============================================================================
// Capture / replay / backfill
// =============================================================================

/// Record a capture hook invocation outcome
/// (`published`, `skipped`, `unregistered`, `zero_identity`, `publish_failed`).
pub fn record_capture(key: &str, outcome: &str) {
    counter!("relay_capture_total", "key" => key.to_string(), "outcome" => outcome.to_string()).increment(1);
}

/// Record a replay outcome (`saved`, `deleted`, `noop`, `dead_lettered`, `failed`).
pub fn record_replay(key: &str, outcome: &str) {
    counter!("relay_replay_total", "key" => key.to_string(), "outcome" => outcome.to_string()).increment(1);
}

/// Record one backfill page.
pub fn record_backfill_page(key: &str, action: &str, rows: usize) {
    counter!("relay_backfill_pages_total", "key" => key.to_string(), "action" => action.to_string()).increment(1);
    counter!("relay_backfill_rows_total", "key" => key.to_string(), "action" => action.to_string())
        .increment(rows as u64);
}

/// Record a completed backfill run.
pub fn record_backfill_run(key: &str, duration: Duration) {
    histogram!("relay_backfill_duration_seconds", "key" => key.to_string()).record(duration.as_secs_f64());
}

/// Record store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn store_retries_total(operation: &str) {
    counter!("relay_store_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Channel bridge
// =============================================================================

/// Record an item fanned out by a channel.
pub fn record_channel_broadcast(channel: &str, subscribers: usize) {
    counter!("relay_channel_items_total", "channel" => channel.to_string()).increment(1);
    histogram!("relay_channel_fanout", "channel" => channel.to_string()).record(subscribers as f64);
}

/// Record an item a subscriber could not take because its channel closed.
pub fn record_channel_dropped(channel: &str, subscriber: &str) {
    counter!(
        "relay_channel_dropped_total",
        "channel" => channel.to_string(),
        "subscriber" => subscriber.to_string()
    )
    .increment(1);
}

// =============================================================================
// Engine
// =============================================================================

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Encode state as numeric for alerting
    let value = match state {
        "Created" => 0.0,
        "Connecting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("relay_engine_state").set(value);
}
