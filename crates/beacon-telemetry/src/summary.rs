//! Session summary emitted on shutdown.
//!
//! Reads the process-wide Prometheus counters and combines them with the
//! figures only the server knows (peak and final client counts).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use prometheus::core::Collector;
use prometheus::CounterVec;
use serde::Serialize;
use tracing::info;

use crate::metrics::{
    CONNECTIONS_TOTAL, ERRORS_TOTAL, FRAMES_DROPPED_TOTAL, MESSAGES_TOTAL, PUBLISH_FAILURES_TOTAL,
    TASK_RUNS_TOTAL, VIOLATIONS_TOTAL,
};

/// Final summary record.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub uptime_secs: i64,
    /// Connection attempts by outcome.
    pub connections: BTreeMap<String, u64>,
    /// Dispatched messages by type tag.
    pub messages_by_kind: BTreeMap<String, u64>,
    pub messages_total: u64,
    pub errors_total: u64,
    pub violations_total: u64,
    pub frames_dropped: u64,
    pub publish_failures: u64,
    /// Scheduled task runs by task.
    pub task_runs: BTreeMap<String, u64>,
    pub peak_clients: usize,
    pub clients_at_shutdown: usize,
}

/// Builds [`SessionSummary`] records.
pub struct SummaryReporter {
    started_at: DateTime<Utc>,
}

impl Default for SummaryReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl SummaryReporter {
    /// Start the session clock.
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Collect the current counters into a summary.
    pub fn collect(&self, peak_clients: usize, clients_at_shutdown: usize) -> SessionSummary {
        let ended_at = Utc::now();
        let messages_by_kind = counter_by_label(&MESSAGES_TOTAL, "kind");
        let messages_total = messages_by_kind.values().sum();

        SessionSummary {
            started_at: self.started_at,
            ended_at,
            uptime_secs: (ended_at - self.started_at).num_seconds(),
            connections: counter_by_label(&CONNECTIONS_TOTAL, "outcome"),
            messages_by_kind,
            messages_total,
            errors_total: counter_total(&ERRORS_TOTAL),
            violations_total: counter_total(&VIOLATIONS_TOTAL),
            frames_dropped: counter_total(&FRAMES_DROPPED_TOTAL),
            publish_failures: PUBLISH_FAILURES_TOTAL.get(),
            task_runs: counter_by_label(&TASK_RUNS_TOTAL, "task"),
            peak_clients,
            clients_at_shutdown,
        }
    }

    /// Log a summary record.
    pub fn output(&self, summary: &SessionSummary) {
        info!(
            uptime_secs = summary.uptime_secs,
            messages_total = summary.messages_total,
            errors_total = summary.errors_total,
            violations_total = summary.violations_total,
            frames_dropped = summary.frames_dropped,
            publish_failures = summary.publish_failures,
            peak_clients = summary.peak_clients,
            clients_at_shutdown = summary.clients_at_shutdown,
            "=== Session Summary ==="
        );
        for (outcome, count) in &summary.connections {
            info!(outcome = %outcome, count, "Connections");
        }
        for (kind, count) in &summary.messages_by_kind {
            info!(kind = %kind, count, "Messages");
        }
        for (task, count) in &summary.task_runs {
            info!(task = %task, count, "Task runs");
        }
    }
}

/// Sum of a counter over all label values.
fn counter_total(counter: &CounterVec) -> u64 {
    counter
        .collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .map(|metric| metric.get_counter().get_value() as u64)
        .sum()
}

/// Counter values keyed by one label.
fn counter_by_label(counter: &CounterVec, label: &str) -> BTreeMap<String, u64> {
    let mut values = BTreeMap::new();
    for family in counter.collect() {
        for metric in family.get_metric() {
            let key = metric
                .get_label()
                .iter()
                .find(|pair| pair.get_name() == label)
                .map(|pair| pair.get_value().to_string());
            if let Some(key) = key {
                *values.entry(key).or_insert(0) += metric.get_counter().get_value() as u64;
            }
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;

    #[test]
    fn test_summary_reflects_counters() {
        Metrics::message("summary_test_kind", 0.2);
        Metrics::message("summary_test_kind", 0.3);
        Metrics::task_run("summary_test_task");

        let reporter = SummaryReporter::new();
        let summary = reporter.collect(4, 1);

        assert!(summary.messages_by_kind["summary_test_kind"] >= 2);
        assert!(summary.messages_total >= 2);
        assert!(summary.task_runs["summary_test_task"] >= 1);
        assert_eq!(summary.peak_clients, 4);
        assert_eq!(summary.clients_at_shutdown, 1);
        assert!(summary.ended_at >= summary.started_at);
    }
}
