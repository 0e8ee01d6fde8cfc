//! Beacon pub/sub server.
//!
//! Accepts TCP connections, performs the WebSocket handshake in a per-
//! connection task and funnels every inbound message through one hub task
//! that owns the client registry, the router and the scheduler.

pub mod config;
pub mod connection;
pub mod error;
pub mod scheduler;
pub mod server;

pub use config::{ServerConfig, CONFIG_ENV, DEFAULT_CONFIG_PATH};
pub use connection::{ConnectionHandle, DisconnectReason, HubEvent};
pub use error::{ServerError, ServerResult};
pub use scheduler::{ScheduledTask, Scheduler, TaskKind};
pub use server::Server;
