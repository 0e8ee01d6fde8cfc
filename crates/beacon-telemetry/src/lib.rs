//! Prometheus metrics and structured logging for the beacon server.
//!
//! - Prometheus counters for connections, dispatch, violations and tasks
//! - Structured logging with tracing (JSON in production)
//! - Session summary on shutdown

pub mod error;
pub mod logging;
pub mod metrics;
pub mod summary;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{init_logging, DEFAULT_FILTER};
pub use metrics::Metrics;
pub use summary::{SessionSummary, SummaryReporter};
