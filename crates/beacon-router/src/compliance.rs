//! Compliance accounting: targets, violation records and the rolling report.

use std::collections::{BTreeMap, VecDeque};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Thresholds each dispatch is checked against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceTargets {
    pub accuracy: f64,
    pub sync_success_rate: f64,
    pub test_pass_rate: f64,
    pub max_latency_ms: u64,
}

impl Default for ComplianceTargets {
    fn default() -> Self {
        Self {
            accuracy: 0.95,
            sync_success_rate: 0.99,
            test_pass_rate: 1.0,
            max_latency_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Classify by relative deviation `|observed - target| / target`.
    pub fn from_deviation(observed: f64, target: f64) -> Self {
        let deviation = if target == 0.0 {
            if observed == 0.0 {
                0.0
            } else {
                f64::INFINITY
            }
        } else {
            ((observed - target) / target).abs()
        };

        if deviation < 0.05 {
            Self::Low
        } else if deviation < 0.15 {
            Self::Medium
        } else if deviation < 0.30 {
            Self::High
        } else {
            Self::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One metric compared against its target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricCheck {
    pub name: String,
    pub observed: f64,
    pub target: f64,
    pub compliant: bool,
}

impl MetricCheck {
    /// Compliant when `observed >= target`.
    pub fn at_least(name: &str, observed: f64, target: f64) -> Self {
        Self {
            name: name.to_string(),
            observed,
            target,
            compliant: observed >= target,
        }
    }

    /// Compliant when `observed <= ceiling`.
    pub fn at_most(name: &str, observed: f64, ceiling: f64) -> Self {
        Self {
            name: name.to_string(),
            observed,
            target: ceiling,
            compliant: observed <= ceiling,
        }
    }

    pub fn severity(&self) -> Severity {
        Severity::from_deviation(self.observed, self.target)
    }
}

/// A recorded compliance violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub metric: String,
    pub observed: f64,
    pub target: f64,
    pub severity: Severity,
    /// Inbound type that produced it.
    pub request_kind: String,
    pub request_id: String,
    pub client_id: String,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
}

impl Violation {
    pub fn from_check(check: &MetricCheck, request_kind: &str, request_id: &str, client_id: &str) -> Self {
        Self {
            metric: check.name.clone(),
            observed: check.observed,
            target: check.target,
            severity: check.severity(),
            request_kind: request_kind.to_string(),
            request_id: request_id.to_string(),
            client_id: client_id.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Bounded violation log. The oldest entry is evicted first.
#[derive(Debug, Clone)]
pub struct ViolationLog {
    entries: VecDeque<Violation>,
    capacity: usize,
    total: u64,
}

impl ViolationLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            total: 0,
        }
    }

    pub fn push(&mut self, violation: Violation) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(violation);
        self.total += 1;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Violations ever recorded, including evicted ones.
    pub fn total_recorded(&self) -> u64 {
        self.total
    }

    /// Up to `n` most recent violations, newest first.
    pub fn recent(&self, n: usize) -> Vec<Violation> {
        self.entries.iter().rev().take(n).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Violation> {
        self.entries.iter()
    }
}

/// Periodic and on-demand compliance report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub timestamp: i64,
    /// Share of compliant service responses, 0-100.
    pub score: f64,
    pub total_requests: u64,
    pub requests_by_kind: BTreeMap<String, u64>,
    pub service_calls: u64,
    pub compliant_calls: u64,
    pub errors: u64,
    pub average_latency_ms: f64,
    pub violations_total: u64,
    pub recent_violations: Vec<Violation>,
    pub connected_clients: usize,
    pub targets: ComplianceTargets,
}

const RECENT_VIOLATIONS: usize = 5;

/// Global dispatch counters and the violation log.
#[derive(Debug, Clone)]
pub struct ComplianceTracker {
    targets: ComplianceTargets,
    total_requests: u64,
    requests_by_kind: BTreeMap<String, u64>,
    service_calls: u64,
    compliant_calls: u64,
    errors: u64,
    total_latency_ms: f64,
    violations: ViolationLog,
}

impl ComplianceTracker {
    pub fn new(targets: ComplianceTargets, log_capacity: usize) -> Self {
        Self {
            targets,
            total_requests: 0,
            requests_by_kind: BTreeMap::new(),
            service_calls: 0,
            compliant_calls: 0,
            errors: 0,
            total_latency_ms: 0.0,
            violations: ViolationLog::new(log_capacity),
        }
    }

    pub fn targets(&self) -> &ComplianceTargets {
        &self.targets
    }

    pub fn record_dispatch(&mut self, kind: &str, latency_ms: f64) {
        self.total_requests += 1;
        *self.requests_by_kind.entry(kind.to_string()).or_default() += 1;
        self.total_latency_ms += latency_ms;
    }

    pub fn record_service_call(&mut self, compliant: bool) {
        self.service_calls += 1;
        if compliant {
            self.compliant_calls += 1;
        }
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    pub fn record_violation(&mut self, violation: Violation) {
        self.violations.push(violation);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    pub fn requests_by_kind(&self) -> &BTreeMap<String, u64> {
        &self.requests_by_kind
    }

    pub fn violations(&self) -> &ViolationLog {
        &self.violations
    }

    /// Compliance score 0-100. No service calls yet counts as fully compliant.
    pub fn score(&self) -> f64 {
        if self.service_calls == 0 {
            return 100.0;
        }
        self.compliant_calls as f64 / self.service_calls as f64 * 100.0
    }

    pub fn report(&self, connected_clients: usize) -> ComplianceReport {
        let average_latency_ms = if self.total_requests == 0 {
            0.0
        } else {
            self.total_latency_ms / self.total_requests as f64
        };

        ComplianceReport {
            timestamp: Utc::now().timestamp_millis(),
            score: self.score(),
            total_requests: self.total_requests,
            requests_by_kind: self.requests_by_kind.clone(),
            service_calls: self.service_calls,
            compliant_calls: self.compliant_calls,
            errors: self.errors,
            average_latency_ms,
            violations_total: self.violations.total_recorded(),
            recent_violations: self.violations.recent(RECENT_VIOLATIONS),
            connected_clients,
            targets: self.targets.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(metric: &str) -> Violation {
        let check = MetricCheck::at_least(metric, 0.5, 0.95);
        Violation::from_check(&check, "category_request", "r1", "c1")
    }

    #[test]
    fn test_severity_bands() {
        assert_eq!(Severity::from_deviation(0.95, 0.95), Severity::Low);
        assert_eq!(Severity::from_deviation(0.92, 0.95), Severity::Low);
        assert_eq!(Severity::from_deviation(0.85, 0.95), Severity::Medium);
        assert_eq!(Severity::from_deviation(0.75, 0.95), Severity::High);
        assert_eq!(Severity::from_deviation(0.50, 0.95), Severity::Critical);
        // Latency over a 100 ms ceiling.
        assert_eq!(Severity::from_deviation(110.0, 100.0), Severity::Medium);
        assert_eq!(Severity::from_deviation(500.0, 100.0), Severity::Critical);
        assert_eq!(Severity::from_deviation(1.0, 0.0), Severity::Critical);
    }

    #[test]
    fn test_metric_checks() {
        assert!(MetricCheck::at_least("accuracy", 0.96, 0.95).compliant);
        assert!(!MetricCheck::at_least("accuracy", 0.90, 0.95).compliant);
        assert!(MetricCheck::at_most("latency", 100.0, 100.0).compliant);
        assert!(!MetricCheck::at_most("latency", 100.5, 100.0).compliant);
    }

    #[test]
    fn test_violation_log_evicts_oldest() {
        let mut log = ViolationLog::new(3);
        for metric in ["a", "b", "c", "d"] {
            log.push(violation(metric));
        }

        assert_eq!(log.len(), 3);
        assert_eq!(log.total_recorded(), 4);
        let metrics: Vec<&str> = log.iter().map(|v| v.metric.as_str()).collect();
        assert_eq!(metrics, vec!["b", "c", "d"]);
        assert_eq!(log.recent(1)[0].metric, "d");
    }

    #[test]
    fn test_tracker_report() {
        let mut tracker = ComplianceTracker::new(ComplianceTargets::default(), 10);
        assert_eq!(tracker.score(), 100.0);

        tracker.record_dispatch("category_request", 4.0);
        tracker.record_service_call(true);
        tracker.record_dispatch("sync_request", 2.0);
        tracker.record_service_call(false);
        tracker.record_violation(violation("success_rate"));
        tracker.record_dispatch("bogus", 0.0);
        tracker.record_error();

        let report = tracker.report(2);
        assert_eq!(report.total_requests, 3);
        assert_eq!(report.requests_by_kind["sync_request"], 1);
        assert_eq!(report.score, 50.0);
        assert_eq!(report.errors, 1);
        assert_eq!(report.average_latency_ms, 2.0);
        assert_eq!(report.violations_total, 1);
        assert_eq!(report.recent_violations.len(), 1);
        assert_eq!(report.connected_clients, 2);
    }
}
