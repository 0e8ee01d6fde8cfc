//! Connected client state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Opaque client identity, generated at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Encoded frame shared between all recipients of one publish.
pub type FrameBytes = Arc<[u8]>;

/// Transport-level send failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Outbound queue is full (slow consumer).
    #[error("outbound queue full")]
    Backpressure,
    /// Connection is gone.
    #[error("transport closed")]
    Closed,
}

/// Outbound side of a client connection.
///
/// `send` must not block: it hands the frame to whatever writes the socket.
/// `close` releases the connection; the registry calls it exactly once.
pub trait Transport {
    fn send(&self, frame: FrameBytes) -> Result<(), TransportError>;
    fn close(&self);
}

/// Per-client counters used for compliance accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientCounters {
    /// Inbound messages dispatched.
    pub messages_received: u64,
    /// Inbound messages by type tag.
    pub requests: BTreeMap<String, u64>,
    /// Error envelopes sent back.
    pub errors: u64,
    /// Frames handed to the transport.
    pub frames_sent: u64,
}

impl ClientCounters {
    /// Count one inbound message of the given kind.
    pub fn record_message(&mut self, kind: &str) {
        self.messages_received += 1;
        *self.requests.entry(kind.to_string()).or_default() += 1;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    /// Requests seen for one kind.
    pub fn requests_for(&self, kind: &str) -> u64 {
        self.requests.get(kind).copied().unwrap_or(0)
    }
}

/// A connected client.
pub struct Client<T> {
    id: ClientId,
    pub(crate) transport: T,
    peer: String,
    pub(crate) subscriptions: BTreeSet<String>,
    counters: ClientCounters,
    connected_at: DateTime<Utc>,
}

impl<T> Client<T> {
    /// Create a client with no subscriptions.
    pub fn new(id: ClientId, transport: T, peer: impl Into<String>) -> Self {
        Self {
            id,
            transport,
            peer: peer.into(),
            subscriptions: BTreeSet::new(),
            counters: ClientCounters::default(),
            connected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Remote address, for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Channels this client is subscribed to.
    pub fn subscriptions(&self) -> &BTreeSet<String> {
        &self.subscriptions
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.contains(channel)
    }

    pub fn counters(&self) -> &ClientCounters {
        &self.counters
    }

    pub fn counters_mut(&mut self) -> &mut ClientCounters {
        &mut self.counters
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T> std::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("subscriptions", &self.subscriptions)
            .field("counters", &self.counters)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}
