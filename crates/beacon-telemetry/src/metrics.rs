//! Prometheus metrics for the beacon server.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration failure
//! (e.g. duplicate metric names) is a fatal configuration error and panics on
//! first use during startup, never later.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, register_int_counter,
    register_int_gauge, CounterVec, Gauge, HistogramVec, IntCounter, IntGauge,
};

/// Currently connected clients.
pub static CONNECTED_CLIENTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("beacon_connected_clients", "Currently connected clients").unwrap()
});

/// Connection attempts by outcome.
/// Labels: outcome (accepted/handshake_failed/rejected_capacity)
pub static CONNECTIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "beacon_connections_total",
        "Connection attempts by outcome",
        &["outcome"]
    )
    .unwrap()
});

/// Client disconnects by reason.
pub static DISCONNECTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "beacon_disconnects_total",
        "Client disconnects by reason",
        &["reason"]
    )
    .unwrap()
});

/// Inbound messages dispatched, by type tag.
pub static MESSAGES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "beacon_messages_total",
        "Inbound messages dispatched by type",
        &["kind"]
    )
    .unwrap()
});

/// Error envelopes sent, by error code.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "beacon_errors_total",
        "Error envelopes sent by code",
        &["code"]
    )
    .unwrap()
});

/// Handler latency in milliseconds.
pub static DISPATCH_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "beacon_dispatch_latency_ms",
        "Message handler latency in milliseconds",
        &["kind"],
        vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 250.0, 500.0, 1000.0]
    )
    .unwrap()
});

/// Compliance violations recorded.
/// Labels: metric (accuracy/latency/success_rate/pass_rate), severity
pub static VIOLATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "beacon_violations_total",
        "Compliance violations by metric and severity",
        &["metric", "severity"]
    )
    .unwrap()
});

/// Inbound frames dropped without dispatch.
pub static FRAMES_DROPPED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "beacon_frames_dropped_total",
        "Inbound frames dropped by reason",
        &["reason"]
    )
    .unwrap()
});

/// Frames that could not be handed to a client transport.
pub static PUBLISH_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "beacon_publish_failures_total",
        "Frames that failed to reach a client transport"
    )
    .unwrap()
});

/// Scheduled task executions.
pub static TASK_RUNS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "beacon_task_runs_total",
        "Scheduled task executions",
        &["task"]
    )
    .unwrap()
});

/// Latest compliance score (0-100).
pub static COMPLIANCE_SCORE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("beacon_compliance_score", "Latest compliance score (0-100)").unwrap()
});

/// Metrics facade.
pub struct Metrics;

impl Metrics {
    /// Record a connection attempt outcome.
    pub fn connection(outcome: &str) {
        CONNECTIONS_TOTAL.with_label_values(&[outcome]).inc();
    }

    /// Set connected client gauge.
    pub fn connected_clients(count: usize) {
        CONNECTED_CLIENTS.set(count as i64);
    }

    /// Record a client disconnect.
    pub fn disconnect(reason: &str) {
        DISCONNECTS_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Record a dispatched message and its handler latency.
    pub fn message(kind: &str, latency_ms: f64) {
        MESSAGES_TOTAL.with_label_values(&[kind]).inc();
        DISPATCH_LATENCY_MS
            .with_label_values(&[kind])
            .observe(latency_ms);
    }

    /// Record an error envelope.
    pub fn error_sent(code: &str) {
        ERRORS_TOTAL.with_label_values(&[code]).inc();
    }

    /// Record a compliance violation.
    pub fn violation(metric: &str, severity: &str) {
        VIOLATIONS_TOTAL
            .with_label_values(&[metric, severity])
            .inc();
    }

    /// Record a dropped inbound frame.
    pub fn frame_dropped(reason: &str) {
        FRAMES_DROPPED_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Record failed deliveries.
    pub fn publish_failures(count: usize) {
        PUBLISH_FAILURES_TOTAL.inc_by(count as u64);
    }

    /// Record a scheduled task run.
    pub fn task_run(task: &str) {
        TASK_RUNS_TOTAL.with_label_values(&[task]).inc();
    }

    /// Update the compliance score gauge.
    pub fn compliance_score(score: f64) {
        COMPLIANCE_SCORE.set(score);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Metrics are process-global, so tests only check monotonic deltas.

    #[test]
    fn test_message_counter_increments() {
        let before = MESSAGES_TOTAL.with_label_values(&["test_kind"]).get();
        Metrics::message("test_kind", 1.5);
        let after = MESSAGES_TOTAL.with_label_values(&["test_kind"]).get();
        assert!(after >= before + 1.0);
    }

    #[test]
    fn test_compliance_score_gauge() {
        Metrics::compliance_score(87.5);
        assert!(COMPLIANCE_SCORE.get() >= 0.0);
    }
}
