// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the relay.
//!
//! Uses the `metrics` crate for backend-agnostic collection; the host
//! process picks the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `telemetry_relay_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `connector`: connector id
//! - `status`: success, error
//! - `transport`: bus, direct

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a publish attempt outcome.
pub fn record_publish(transport: &str, status: &str) {
    counter!(
        "telemetry_relay_publishes_total",
        "transport" => transport.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record records resent after gap detection.
pub fn record_resent(count: usize) {
    counter!("telemetry_relay_resent_total").increment(count as u64);
}

/// Record gaps found by a reconciliation check.
pub fn record_gaps_detected(count: usize) {
    counter!("telemetry_relay_gaps_detected_total").increment(count as u64);
}

/// Record a reconciliation check outcome.
pub fn record_check(status: &str) {
    counter!(
        "telemetry_relay_checks_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record check duration.
pub fn record_check_duration(duration: Duration) {
    histogram!("telemetry_relay_check_seconds").record(duration.as_secs_f64());
}

/// Record a sweep pass over unverified windows.
pub fn record_sweep(recovered: usize, remaining: usize) {
    counter!("telemetry_relay_sweep_recovered_total").increment(recovered as u64);
    gauge!("telemetry_relay_failed_windows").set(remaining as f64);
}

/// Record a snapshot flush.
pub fn record_snapshot_flush(count: usize, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "telemetry_relay_snapshot_flush_total",
        "status" => status
    )
    .increment(1);
    if success {
        counter!("telemetry_relay_snapshot_entries_total").increment(count as u64);
    }
}

/// Set snapshot buffer depth (entries pending flush).
pub fn set_snapshot_buffer(count: usize) {
    gauge!("telemetry_relay_snapshot_buffer_entries").set(count as f64);
}

/// Record snapshot rows removed by retention.
pub fn record_retention_purge(count: u64) {
    counter!("telemetry_relay_retention_purged_total").increment(count);
}

/// Set retry queue depth.
pub fn set_retry_queue_depth(count: usize) {
    gauge!("telemetry_relay_retry_queue_entries").set(count as f64);
}

/// Record retry queue drain outcome.
pub fn record_retry_drain(delivered: usize, requeued: usize) {
    counter!("telemetry_relay_retry_delivered_total").increment(delivered as u64);
    if requeued > 0 {
        counter!("telemetry_relay_retry_requeued_total").increment(requeued as u64);
    }
}

/// Set transport health (1 = connected, 0 = down).
pub fn set_transport_healthy(transport: &str, healthy: bool) {
    gauge!(
        "telemetry_relay_transport_healthy",
        "transport" => transport.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Set the number of running connector tasks.
pub fn set_active_connectors(count: usize) {
    gauge!("telemetry_relay_active_connectors").set(count as f64);
}

/// Record engine state transitions.
pub fn set_engine_state(state: &str) {
    counter!(
        "telemetry_relay_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record startup phase duration.
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "telemetry_relay_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}
