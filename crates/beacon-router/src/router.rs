//! Message router.
//!
//! Parses each inbound text payload, dispatches it on its type tag, replies
//! to the sender through the registry and keeps the compliance accounting.
//! Collaborator calls are synchronous; every handler call is timed.

use std::time::Instant;

use beacon_registry::{ClientId, PublishReport, Registry, Transport};
use beacon_telemetry::Metrics;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collaborator::{guarded, Collaborators};
use crate::compliance::{
    ComplianceReport, ComplianceTargets, ComplianceTracker, MetricCheck, Severity, Violation,
};
use crate::error::{RouterError, RouterResult};
use crate::message::{
    Envelope, ErrorBody, HeartbeatAck, OutboundMessage, Request, ServiceResponse,
    SubscriptionAck, Welcome, INBOUND_TYPES,
};

/// Violations are published here.
pub const ALERTS_CHANNEL: &str = "alerts";
/// Periodic compliance reports.
pub const METRICS_CHANNEL: &str = "metrics";
/// Periodic dispatch snapshots.
pub const ANALYTICS_CHANNEL: &str = "analytics";
/// Model refresh notices.
pub const MODELS_CHANNEL: &str = "models";

/// Counter label for payloads that never parsed into a request.
const INVALID_KIND: &str = "invalid";

/// Static part of the welcome envelope.
#[derive(Debug, Clone)]
pub struct WelcomeDescriptor {
    pub server_name: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub default_channels: Vec<String>,
    /// Subscribe new clients to `default_channels` on registration.
    pub auto_subscribe_defaults: bool,
}

impl Default for WelcomeDescriptor {
    fn default() -> Self {
        Self {
            server_name: "beacon".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: [
                "pubsub",
                "heartbeat",
                "category_prediction",
                "analytics",
                "sync",
                "self_test",
                "compliance_monitoring",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            default_channels: vec![METRICS_CHANNEL.to_string(), ALERTS_CHANNEL.to_string()],
            auto_subscribe_defaults: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub targets: ComplianceTargets,
    pub violation_log_capacity: usize,
    pub welcome: WelcomeDescriptor,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            targets: ComplianceTargets::default(),
            violation_log_capacity: 1000,
            welcome: WelcomeDescriptor::default(),
        }
    }
}

/// What one dispatch did.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    /// Counter label of the request.
    pub kind: &'static str,
    /// Wire type of the reply.
    pub reply: &'static str,
    /// Whether the reply reached the client's transport.
    pub delivered: bool,
    pub latency_ms: f64,
    pub violations: usize,
}

/// Handler result before latency is known.
enum Handled {
    Reply(OutboundMessage),
    Service {
        wrap: fn(ServiceResponse) -> OutboundMessage,
        result: serde_json::Value,
        metric: MetricCheck,
    },
}

pub struct Router {
    collaborators: Collaborators,
    tracker: ComplianceTracker,
    welcome: WelcomeDescriptor,
}

impl Router {
    pub fn new(config: RouterConfig, collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            tracker: ComplianceTracker::new(config.targets, config.violation_log_capacity),
            welcome: config.welcome,
        }
    }

    pub fn tracker(&self) -> &ComplianceTracker {
        &self.tracker
    }

    pub fn targets(&self) -> &ComplianceTargets {
        self.tracker.targets()
    }

    pub fn compliance_report(&self, connected_clients: usize) -> ComplianceReport {
        self.tracker.report(connected_clients)
    }

    /// Build the welcome envelope for a client.
    pub fn welcome(
        &self,
        client_id: &ClientId,
        connected_at: DateTime<Utc>,
        subscribed: Vec<String>,
    ) -> OutboundMessage {
        OutboundMessage::AcademicWelcome(Welcome {
            server: self.welcome.server_name.clone(),
            version: self.welcome.version.clone(),
            client_id: client_id.to_string(),
            capabilities: self.welcome.capabilities.clone(),
            message_types: INBOUND_TYPES.iter().map(|t| t.to_string()).collect(),
            default_channels: self.welcome.default_channels.clone(),
            subscribed,
            compliance_targets: self.tracker.targets().clone(),
            connected_at,
        })
    }

    /// Greet a freshly registered client, subscribing it to the default
    /// channels first when configured to. Returns whether the welcome was
    /// delivered.
    pub fn welcome_client<T: Transport>(
        &self,
        registry: &mut Registry<T>,
        client_id: &ClientId,
    ) -> bool {
        if self.welcome.auto_subscribe_defaults {
            for channel in &self.welcome.default_channels {
                if let Err(e) = registry.subscribe(client_id, channel) {
                    warn!(client_id = %client_id, channel = %channel, error = %e, "Default subscription failed");
                }
            }
        }

        let Some(client) = registry.get(client_id) else {
            return false;
        };
        let subscribed = client.subscriptions().iter().cloned().collect();
        let message = self.welcome(client_id, client.connected_at(), subscribed);
        Self::send(registry, client_id, &message)
    }

    /// Dispatch one inbound text payload from `client_id`.
    ///
    /// Always answers the sender with exactly one envelope (a response or an
    /// `error`); violations are additionally published on [`ALERTS_CHANNEL`].
    pub fn dispatch<T: Transport>(
        &mut self,
        registry: &mut Registry<T>,
        client_id: &ClientId,
        text: &str,
    ) -> DispatchOutcome {
        let (request_id, parsed) = match Envelope::parse(text) {
            Ok(envelope) => {
                let request_id = envelope
                    .request_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                (Some(request_id), Request::from_envelope(&envelope))
            }
            Err(e) => (None, Err(e)),
        };
        let kind = parsed.as_ref().map_or(INVALID_KIND, Request::kind);
        let reply_id = request_id.clone().unwrap_or_default();

        let started = Instant::now();
        let handled = parsed.and_then(|request| self.handle(registry, client_id, &reply_id, request));
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.tracker.record_dispatch(kind, latency_ms);
        Metrics::message(kind, latency_ms);
        if let Some(client) = registry.get_mut(client_id) {
            client.counters_mut().record_message(kind);
        }

        let latency = MetricCheck::at_most(
            "latency",
            latency_ms,
            self.tracker.targets().max_latency_ms as f64,
        );
        let mut failed_checks = Vec::new();
        if !latency.compliant {
            failed_checks.push(latency.clone());
        }

        let reply = match handled {
            Ok(Handled::Reply(message)) => message,
            Ok(Handled::Service {
                wrap,
                result,
                metric,
            }) => {
                let compliant = metric.compliant && latency.compliant;
                self.tracker.record_service_call(compliant);
                if !metric.compliant {
                    failed_checks.push(metric.clone());
                }
                wrap(ServiceResponse {
                    request_id: reply_id.clone(),
                    result,
                    metric,
                    latency_ms,
                    compliant,
                })
            }
            Err(e) => {
                debug!(client_id = %client_id, kind, code = e.code(), error = %e, "Request rejected");
                self.tracker.record_error();
                Metrics::error_sent(e.code());
                if let Some(client) = registry.get_mut(client_id) {
                    client.counters_mut().record_error();
                }
                OutboundMessage::Error(ErrorBody::from_error(&e, request_id))
            }
        };

        let delivered = Self::send(registry, client_id, &reply);

        for check in &failed_checks {
            self.raise_violation(registry, check, kind, &reply_id, client_id);
        }

        DispatchOutcome {
            kind,
            reply: reply.kind(),
            delivered,
            latency_ms,
            violations: failed_checks.len(),
        }
    }

    fn handle<T: Transport>(
        &self,
        registry: &mut Registry<T>,
        client_id: &ClientId,
        request_id: &str,
        request: Request,
    ) -> RouterResult<Handled> {
        let targets = self.tracker.targets();
        let request_id = request_id.to_string();

        let handled = match request {
            Request::Subscribe { channel } => {
                let changed = registry.subscribe(client_id, &channel)?;
                info!(client_id = %client_id, channel = %channel, changed, "Subscribed");
                Handled::Reply(OutboundMessage::SubscriptionConfirmed(SubscriptionAck {
                    request_id,
                    channel,
                    changed,
                }))
            }
            Request::Unsubscribe { channel } => {
                let changed = registry.unsubscribe(client_id, &channel)?;
                info!(client_id = %client_id, channel = %channel, changed, "Unsubscribed");
                Handled::Reply(OutboundMessage::UnsubscriptionConfirmed(SubscriptionAck {
                    request_id,
                    channel,
                    changed,
                }))
            }
            Request::Heartbeat { client_time } => {
                Handled::Reply(OutboundMessage::HeartbeatResponse(HeartbeatAck {
                    request_id,
                    server_time: Utc::now().timestamp_millis(),
                    client_time,
                }))
            }
            Request::Category { item } => {
                let prediction = guarded("prediction", || self.collaborators.prediction.predict(&item))?;
                Handled::Service {
                    wrap: OutboundMessage::CategoryResponse,
                    metric: MetricCheck::at_least("accuracy", prediction.accuracy, targets.accuracy),
                    result: serde_json::to_value(&prediction)?,
                }
            }
            Request::Analytics { kind, params } => {
                let analysis = guarded("analytics", || self.collaborators.analytics.analyze(&kind, &params))?;
                Handled::Service {
                    wrap: OutboundMessage::AnalyticsResponse,
                    metric: MetricCheck::at_least("accuracy", analysis.accuracy, targets.accuracy),
                    result: json!({ "kind": kind, "output": analysis.result }),
                }
            }
            Request::Sync { config } => {
                let outcome = guarded("sync", || self.collaborators.sync.sync(&config))?;
                Handled::Service {
                    wrap: OutboundMessage::SyncResponse,
                    metric: MetricCheck::at_least(
                        "success_rate",
                        outcome.success_rate,
                        targets.sync_success_rate,
                    ),
                    result: serde_json::to_value(&outcome)?,
                }
            }
            Request::Test { test_type } => {
                let report = guarded("tests", || self.collaborators.tests.run(&test_type))?;
                let pass_rate = report.pass_rate();
                Handled::Service {
                    wrap: OutboundMessage::TestResponse,
                    metric: MetricCheck::at_least("pass_rate", pass_rate, targets.test_pass_rate),
                    result: json!({
                        "test_type": &report.test_type,
                        "passed": report.passed(),
                        "failed": report.failed(),
                        "pass_rate": pass_rate,
                        "cases": &report.cases,
                    }),
                }
            }
            Request::ComplianceCheck => Handled::Reply(OutboundMessage::ComplianceUpdate(
                self.tracker.report(registry.len()),
            )),
            Request::Unknown(kind) => return Err(RouterError::UnknownType(kind)),
        };
        Ok(handled)
    }

    fn raise_violation<T: Transport>(
        &mut self,
        registry: &mut Registry<T>,
        check: &MetricCheck,
        kind: &str,
        request_id: &str,
        client_id: &ClientId,
    ) {
        let violation = Violation::from_check(check, kind, request_id, &client_id.to_string());
        match violation.severity {
            Severity::Low => info!(
                metric = %violation.metric,
                observed = violation.observed,
                target = violation.target,
                severity = %violation.severity,
                request_kind = kind,
                "Compliance violation"
            ),
            Severity::Medium => warn!(
                metric = %violation.metric,
                observed = violation.observed,
                target = violation.target,
                severity = %violation.severity,
                request_kind = kind,
                "Compliance violation"
            ),
            Severity::High | Severity::Critical => error!(
                metric = %violation.metric,
                observed = violation.observed,
                target = violation.target,
                severity = %violation.severity,
                request_kind = kind,
                "Compliance violation"
            ),
        }

        Metrics::violation(&violation.metric, violation.severity.as_str());
        self.tracker.record_violation(violation.clone());
        Self::publish(
            registry,
            ALERTS_CHANNEL,
            &OutboundMessage::ComplianceViolation(violation),
        );
    }

    /// Serialize and fan a message out to a channel.
    pub fn publish<T: Transport>(
        registry: &mut Registry<T>,
        channel: &str,
        message: &OutboundMessage,
    ) -> PublishReport {
        let payload = match message.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(channel, kind = message.kind(), error = %e, "Failed to serialize message");
                return PublishReport::default();
            }
        };
        let report = registry.publish(channel, &payload);
        if !report.failed.is_empty() {
            Metrics::publish_failures(report.failed.len());
        }
        report
    }

    /// Serialize and send a message to one client.
    pub fn send<T: Transport>(
        registry: &mut Registry<T>,
        client_id: &ClientId,
        message: &OutboundMessage,
    ) -> bool {
        let payload = match message.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(client_id = %client_id, kind = message.kind(), error = %e, "Failed to serialize message");
                return false;
            }
        };
        match registry.send_to(client_id, &payload) {
            Ok(()) => true,
            Err(e) => {
                debug!(client_id = %client_id, kind = message.kind(), error = %e, "Reply not delivered");
                Metrics::publish_failures(1);
                false
            }
        }
    }
}
