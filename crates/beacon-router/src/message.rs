//! Wire envelopes.
//!
//! Inbound text is parsed into an [`Envelope`] and then a typed [`Request`].
//! Everything the server sends is an [`OutboundMessage`], serialized as
//! `{"type": <tag>, "data": {...}}`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collaborator::ItemDescription;
use crate::compliance::{ComplianceReport, ComplianceTargets, MetricCheck, Violation};
use crate::error::{RouterError, RouterResult};

/// Inbound type tags the router understands.
pub const INBOUND_TYPES: &[&str] = &[
    "subscribe",
    "unsubscribe",
    "heartbeat",
    "category_request",
    "analytics_request",
    "sync_request",
    "test_request",
    "compliance_check",
];

/// Decoded inbound envelope, before validation of `data`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub data: Value,
    /// Client-side send time, milliseconds since the epoch. Kept raw so a
    /// wrong type is reported against the request instead of the envelope.
    #[serde(default)]
    pub timestamp: Option<Value>,
}

impl Envelope {
    pub fn parse(text: &str) -> RouterResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Numeric `timestamp`, if one was sent.
    pub fn client_time(&self) -> RouterResult<Option<f64>> {
        match &self.timestamp {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value.as_f64().map(Some).ok_or(RouterError::InvalidField {
                field: "timestamp",
                reason: "must be a number".to_string(),
            }),
        }
    }
}

/// A validated inbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Heartbeat { client_time: Option<f64> },
    Category { item: ItemDescription },
    Analytics { kind: String, params: Value },
    Sync { config: Value },
    Test { test_type: String },
    ComplianceCheck,
    /// Type tag the router does not recognize.
    Unknown(String),
}

impl Request {
    /// Validate an envelope's `data` against its type tag.
    pub fn from_envelope(envelope: &Envelope) -> RouterResult<Self> {
        let data = &envelope.data;
        let client_time = envelope.client_time()?;
        let request = match envelope.kind.as_str() {
            "subscribe" => Self::Subscribe {
                channel: channel_field(data)?,
            },
            "unsubscribe" => Self::Unsubscribe {
                channel: channel_field(data)?,
            },
            "heartbeat" => Self::Heartbeat {
                client_time,
            },
            "category_request" => {
                let item = data.get("item").ok_or(RouterError::MissingField("item"))?;
                if item.get("title").and_then(Value::as_str).is_none() {
                    return Err(RouterError::MissingField("item.title"));
                }
                let item = serde_json::from_value(item.clone()).map_err(|e| {
                    RouterError::InvalidField {
                        field: "item",
                        reason: e.to_string(),
                    }
                })?;
                Self::Category { item }
            }
            "analytics_request" => Self::Analytics {
                kind: required_str(data, "kind")?,
                params: data.get("params").cloned().unwrap_or(Value::Null),
            },
            "sync_request" => Self::Sync {
                config: data.clone(),
            },
            "test_request" => Self::Test {
                test_type: required_str(data, "test_type")?,
            },
            "compliance_check" => Self::ComplianceCheck,
            other => Self::Unknown(other.to_string()),
        };
        Ok(request)
    }

    /// Label used for counters. Unknown tags share one label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Category { .. } => "category_request",
            Self::Analytics { .. } => "analytics_request",
            Self::Sync { .. } => "sync_request",
            Self::Test { .. } => "test_request",
            Self::ComplianceCheck => "compliance_check",
            Self::Unknown(_) => "unknown",
        }
    }
}

fn required_str(data: &Value, field: &'static str) -> RouterResult<String> {
    let value = data
        .get(field)
        .and_then(Value::as_str)
        .ok_or(RouterError::MissingField(field))?;
    let value = value.trim();
    if value.is_empty() {
        return Err(RouterError::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(value.to_string())
}

fn channel_field(data: &Value) -> RouterResult<String> {
    required_str(data, "channel")
}

/// Every envelope the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    AcademicWelcome(Welcome),
    SubscriptionConfirmed(SubscriptionAck),
    UnsubscriptionConfirmed(SubscriptionAck),
    HeartbeatResponse(HeartbeatAck),
    CategoryResponse(ServiceResponse),
    AnalyticsResponse(ServiceResponse),
    SyncResponse(ServiceResponse),
    TestResponse(ServiceResponse),
    ComplianceUpdate(ComplianceReport),
    ComplianceViolation(Violation),
    AnalyticsSnapshot(AnalyticsSnapshot),
    ModelRefresh(ModelRefresh),
    Error(ErrorBody),
}

impl OutboundMessage {
    pub fn to_json(&self) -> RouterResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire type tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AcademicWelcome(_) => "academic_welcome",
            Self::SubscriptionConfirmed(_) => "subscription_confirmed",
            Self::UnsubscriptionConfirmed(_) => "unsubscription_confirmed",
            Self::HeartbeatResponse(_) => "heartbeat_response",
            Self::CategoryResponse(_) => "category_response",
            Self::AnalyticsResponse(_) => "analytics_response",
            Self::SyncResponse(_) => "sync_response",
            Self::TestResponse(_) => "test_response",
            Self::ComplianceUpdate(_) => "compliance_update",
            Self::ComplianceViolation(_) => "compliance_violation",
            Self::AnalyticsSnapshot(_) => "analytics_snapshot",
            Self::ModelRefresh(_) => "model_refresh",
            Self::Error(_) => "error",
        }
    }
}

/// Static server descriptor sent to every new client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub server: String,
    pub version: String,
    pub client_id: String,
    pub capabilities: Vec<String>,
    pub message_types: Vec<String>,
    pub default_channels: Vec<String>,
    /// Channels the client was subscribed to on registration.
    pub subscribed: Vec<String>,
    pub compliance_targets: ComplianceTargets,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionAck {
    pub request_id: String,
    pub channel: String,
    /// False when the request did not change membership.
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub request_id: String,
    /// Server time, milliseconds since the epoch.
    pub server_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_time: Option<f64>,
}

/// Reply to a collaborator-backed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub request_id: String,
    pub result: Value,
    pub metric: MetricCheck,
    pub latency_ms: f64,
    /// Metric met its target and latency stayed under the ceiling.
    pub compliant: bool,
}

/// Periodic broadcast of dispatch activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub timestamp: i64,
    pub uptime_secs: i64,
    pub connected_clients: usize,
    pub messages_total: u64,
    pub messages_by_kind: BTreeMap<String, u64>,
    /// Subscriber count per channel.
    pub channels: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRefresh {
    pub model: String,
    pub version: u64,
    pub refreshed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub code: String,
    pub message: String,
    /// The offending type tag, for `unknown_type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_type: Option<String>,
}

impl ErrorBody {
    pub fn from_error(error: &RouterError, request_id: Option<String>) -> Self {
        let received_type = match error {
            RouterError::UnknownType(kind) => Some(kind.clone()),
            _ => None,
        };
        Self {
            request_id,
            code: error.code().to_string(),
            message: error.to_string(),
            received_type,
        }
    }
}
