//! Message routing for the beacon server.
//!
//! - Inbound envelopes parsed into a typed [`Request`]
//! - Outbound envelopes as one serde-tagged [`OutboundMessage`]
//! - Dispatch to collaborator services with latency and compliance accounting
//! - Built-in collaborators for standalone operation

pub mod builtin;
pub mod collaborator;
pub mod compliance;
pub mod error;
pub mod message;
pub mod router;

pub use builtin::{KeywordClassifier, LoopbackSync, SelfDiagnostics, SummaryAnalytics};
pub use collaborator::{
    guarded, panic_message, AnalyticsResult, AnalyticsService, Collaborators, ItemDescription,
    Prediction, PredictionService, ServiceError, SyncOutcome, SyncService, TestCase, TestReport,
    TestSuiteService,
};
pub use compliance::{
    ComplianceReport, ComplianceTargets, ComplianceTracker, MetricCheck, Severity, Violation,
    ViolationLog,
};
pub use error::{RouterError, RouterResult};
pub use message::{
    AnalyticsSnapshot, Envelope, ErrorBody, HeartbeatAck, ModelRefresh, OutboundMessage, Request,
    ServiceResponse, SubscriptionAck, Welcome, INBOUND_TYPES,
};
pub use router::{
    DispatchOutcome, Router, RouterConfig, WelcomeDescriptor, ALERTS_CHANNEL, ANALYTICS_CHANNEL,
    METRICS_CHANNEL, MODELS_CHANNEL,
};
