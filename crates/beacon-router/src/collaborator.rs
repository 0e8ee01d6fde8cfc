//! Business collaborator seams.
//!
//! The router treats prediction, analytics, sync and the test suite as
//! black boxes. Each reports its own quality metric, which the router checks
//! against the configured compliance targets.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::error;

use crate::builtin::{KeywordClassifier, LoopbackSync, SelfDiagnostics, SummaryAnalytics};

/// Collaborator failure, answered with a `service_error` envelope.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServiceError {
    #[error("Unsupported {what}: {value}")]
    Unsupported { what: &'static str, value: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// Item to classify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDescription {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f64,
    /// Model accuracy as reported by the collaborator.
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsResult {
    pub result: Value,
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub status: String,
    pub records: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub test_type: String,
    pub cases: Vec<TestCase>,
}

impl TestReport {
    pub fn passed(&self) -> usize {
        self.cases.iter().filter(|case| case.passed).count()
    }

    pub fn failed(&self) -> usize {
        self.cases.len() - self.passed()
    }

    /// Share of passing cases. An empty run passes.
    pub fn pass_rate(&self) -> f64 {
        if self.cases.is_empty() {
            return 1.0;
        }
        self.passed() as f64 / self.cases.len() as f64
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait PredictionService: Send + Sync {
    fn predict(&self, item: &ItemDescription) -> Result<Prediction, ServiceError>;
}

#[cfg_attr(test, mockall::automock)]
pub trait AnalyticsService: Send + Sync {
    fn analyze(&self, kind: &str, params: &Value) -> Result<AnalyticsResult, ServiceError>;
}

#[cfg_attr(test, mockall::automock)]
pub trait SyncService: Send + Sync {
    fn sync(&self, config: &Value) -> Result<SyncOutcome, ServiceError>;
}

#[cfg_attr(test, mockall::automock)]
pub trait TestSuiteService: Send + Sync {
    fn run(&self, test_type: &str) -> Result<TestReport, ServiceError>;
}

/// The set of collaborators a router dispatches to.
pub struct Collaborators {
    pub prediction: Box<dyn PredictionService>,
    pub analytics: Box<dyn AnalyticsService>,
    pub sync: Box<dyn SyncService>,
    pub tests: Box<dyn TestSuiteService>,
}

impl Collaborators {
    /// Built-in standalone implementations.
    pub fn builtin() -> Self {
        Self {
            prediction: Box::new(KeywordClassifier::default()),
            analytics: Box::new(SummaryAnalytics::default()),
            sync: Box::new(LoopbackSync::default()),
            tests: Box::new(SelfDiagnostics::default()),
        }
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Run a collaborator call. A panic inside it becomes
/// [`ServiceError::Unavailable`] instead of unwinding into the caller.
pub fn guarded<R>(
    service: &'static str,
    call: impl FnOnce() -> Result<R, ServiceError>,
) -> Result<R, ServiceError> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            error!(service, reason = %reason, "Collaborator panicked");
            Err(ServiceError::Unavailable(format!("{service} failed: {reason}")))
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}
