//! Server configuration.
//!
//! Loaded from TOML. Every field has a default, so a partial file (or no
//! file at all) yields a working configuration.

use std::path::Path;
use std::time::Duration;

use beacon_router::{ComplianceTargets, RouterConfig, WelcomeDescriptor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ServerError, ServerResult};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "BEACON_CONFIG";
/// Config file used when neither the CLI nor the environment names one.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenerConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub compliance: ComplianceConfig,
    #[serde(default)]
    pub welcome: WelcomeConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Listener and connection limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Address to listen on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Upper bound on one event loop iteration (ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Time allowed for the opening handshake (ms).
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Largest accepted inbound payload (bytes).
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Per-client outbound frame queue depth.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Maximum concurrently registered clients.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8765".to_string()
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

fn default_outbound_queue() -> usize {
    256
}

fn default_max_clients() -> usize {
    1024
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            poll_interval_ms: default_poll_interval_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            outbound_queue: default_outbound_queue(),
            max_clients: default_max_clients(),
        }
    }
}

impl ListenerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Scheduled task intervals in seconds. Zero disables a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_compliance_interval_secs")]
    pub compliance_interval_secs: u64,
    #[serde(default = "default_broadcast_interval_secs")]
    pub broadcast_interval_secs: u64,
    #[serde(default = "default_model_refresh_interval_secs")]
    pub model_refresh_interval_secs: u64,
    /// Model name announced on refresh.
    #[serde(default = "default_model_name")]
    pub model_name: String,
}

fn default_compliance_interval_secs() -> u64 {
    30
}

fn default_broadcast_interval_secs() -> u64 {
    10
}

fn default_model_refresh_interval_secs() -> u64 {
    300
}

fn default_model_name() -> String {
    "keyword-classifier".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            compliance_interval_secs: default_compliance_interval_secs(),
            broadcast_interval_secs: default_broadcast_interval_secs(),
            model_refresh_interval_secs: default_model_refresh_interval_secs(),
            model_name: default_model_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceConfig {
    #[serde(default = "default_accuracy_target")]
    pub accuracy_target: f64,
    #[serde(default = "default_sync_success_target")]
    pub sync_success_target: f64,
    #[serde(default = "default_test_pass_target")]
    pub test_pass_target: f64,
    /// Handler latency ceiling (ms).
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
    #[serde(default = "default_violation_log_capacity")]
    pub violation_log_capacity: usize,
}

fn default_accuracy_target() -> f64 {
    0.95
}

fn default_sync_success_target() -> f64 {
    0.99
}

fn default_test_pass_target() -> f64 {
    1.0
}

fn default_max_latency_ms() -> u64 {
    100
}

fn default_violation_log_capacity() -> usize {
    1000
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            accuracy_target: default_accuracy_target(),
            sync_success_target: default_sync_success_target(),
            test_pass_target: default_test_pass_target(),
            max_latency_ms: default_max_latency_ms(),
            violation_log_capacity: default_violation_log_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomeConfig {
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,
    #[serde(default = "default_channels")]
    pub default_channels: Vec<String>,
    #[serde(default)]
    pub auto_subscribe_defaults: bool,
}

fn default_server_name() -> String {
    WelcomeDescriptor::default().server_name
}

fn default_capabilities() -> Vec<String> {
    WelcomeDescriptor::default().capabilities
}

fn default_channels() -> Vec<String> {
    WelcomeDescriptor::default().default_channels
}

impl Default for WelcomeConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            capabilities: default_capabilities(),
            default_channels: default_channels(),
            auto_subscribe_defaults: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Default `tracing` filter; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_log_filter() -> String {
    beacon_telemetry::DEFAULT_FILTER.to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
        }
    }
}

impl ServerConfig {
    /// Load from a specific file.
    pub fn from_file(path: impl AsRef<Path>) -> ServerResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ServerError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ServerResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ServerError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    /// Resolve the config path: CLI arg > `BEACON_CONFIG` > default.
    pub fn resolve_path(cli: Option<String>) -> String {
        cli.or_else(|| std::env::var(CONFIG_ENV).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }

    pub fn validate(&self) -> ServerResult<()> {
        if self.server.outbound_queue == 0 {
            return Err(ServerError::Config("server.outbound_queue must be > 0".to_string()));
        }
        if self.server.max_frame_bytes == 0 {
            return Err(ServerError::Config("server.max_frame_bytes must be > 0".to_string()));
        }
        if self.compliance.violation_log_capacity == 0 {
            return Err(ServerError::Config(
                "compliance.violation_log_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Router settings derived from this configuration.
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            targets: ComplianceTargets {
                accuracy: self.compliance.accuracy_target,
                sync_success_rate: self.compliance.sync_success_target,
                test_pass_rate: self.compliance.test_pass_target,
                max_latency_ms: self.compliance.max_latency_ms,
            },
            violation_log_capacity: self.compliance.violation_log_capacity,
            welcome: WelcomeDescriptor {
                server_name: self.welcome.server_name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                capabilities: self.welcome.capabilities.clone(),
                default_channels: self.welcome.default_channels.clone(),
                auto_subscribe_defaults: self.welcome.auto_subscribe_defaults,
            },
        }
    }
}
