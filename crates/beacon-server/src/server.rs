//! Event loop and lifecycle.
//!
//! A single hub task owns the registry, router and scheduler. It waits on
//! the stop signal, the listener, the connection event queue and a poll
//! ticker, then runs whatever scheduled tasks are due. Connection tasks talk
//! to it only through [`HubEvent`]s.

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use beacon_registry::{Client, ClientId, Registry, Transport};
use beacon_router::{
    panic_message, AnalyticsSnapshot, Collaborators, ErrorBody, ModelRefresh, OutboundMessage,
    Router,
};
use beacon_telemetry::{Metrics, SessionSummary, SummaryReporter};
use beacon_ws::encode_text;
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::{run_connection, ConnectionHandle, ConnectionSettings, HubEvent};
use crate::error::{ServerError, ServerResult};
use crate::scheduler::{Scheduler, TaskKind};

/// Depth of the connection event queue.
const EVENT_QUEUE: usize = 1024;
/// How long shutdown waits for connection tasks.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// Error code sent to connections refused at `max_clients`.
const SERVER_FULL: &str = "server_full";
/// Error code sent when a connection arrives with an id already registered.
const DUPLICATE_CLIENT: &str = "duplicate_client";
/// First pause after a failed accept.
const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(50);
/// Longest pause between accept attempts while accepts keep failing.
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Listening,
    ShuttingDown,
    Stopped,
}

/// A bound, not yet running server.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    collaborators: Collaborators,
}

impl Server {
    /// Bind the listener with the built-in collaborators.
    pub async fn bind(config: ServerConfig) -> ServerResult<Self> {
        Self::bind_with(config, Collaborators::builtin()).await
    }

    pub async fn bind_with(config: ServerConfig, collaborators: Collaborators) -> ServerResult<Self> {
        config.validate()?;
        let addr = config.server.bind_addr.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Listener bound");

        Ok(Self {
            config,
            listener,
            local_addr,
            collaborators,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run until `shutdown` is cancelled, then tear down and return the
    /// session summary.
    pub async fn run(self, shutdown: CancellationToken) -> ServerResult<SessionSummary> {
        let Server {
            config,
            listener,
            local_addr,
            collaborators,
        } = self;

        let reporter = SummaryReporter::new();
        let (events_tx, mut events_rx) = mpsc::channel::<HubEvent>(EVENT_QUEUE);
        let connection_token = shutdown.child_token();
        let mut connections = JoinSet::new();
        let mut hub = Hub::new(&config, collaborators);

        let mut ticker = tokio::time::interval(config.server.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = AcceptBackoff::default();

        info!(addr = %local_addr, "Entering event loop");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }

                event = events_rx.recv() => match event {
                    Some(event) => {
                        if !hub_step(&mut hub, |hub| hub.handle_event(event)) {
                            break;
                        }
                    }
                    None => {
                        error!("Event queue closed unexpectedly");
                        break;
                    }
                },

                accepted = listener.accept(), if !backoff.is_paused() => match accepted {
                    Ok((stream, peer)) => {
                        backoff.succeeded();
                        debug!(peer = %peer, "Accepted connection");
                        connections.spawn(run_connection(
                            stream,
                            peer,
                            hub.settings,
                            events_tx.clone(),
                            connection_token.clone(),
                        ));
                    }
                    Err(e) => {
                        let delay = backoff.failed(tokio::time::Instant::now());
                        Metrics::connection("accept_failed");
                        warn!(
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Accept failed, pausing accepts"
                        );
                    }
                },

                _ = tokio::time::sleep_until(backoff.deadline()), if backoff.is_paused() => {
                    backoff.resume();
                }

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Connection task failed");
                    }
                }

                _ = ticker.tick() => {}
            }

            if !hub_step(&mut hub, |hub| hub.run_due_tasks(Instant::now())) {
                break;
            }
        }

        hub.transition(ServerState::ShuttingDown);
        let closed = hub.close_all();
        drop(events_rx);
        connection_token.cancel();

        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(
                remaining = connections.len(),
                "Connection tasks did not finish in time, aborting"
            );
            connections.abort_all();
        }
        drop(listener);
        hub.transition(ServerState::Stopped);

        let summary = reporter.collect(hub.peak_clients, closed);
        reporter.output(&summary);
        Ok(summary)
    }
}

/// Pacing for accept retries. Errors such as running out of file
/// descriptors leave the listener readable, so accept would fail again
/// immediately.
#[derive(Debug, Default)]
struct AcceptBackoff {
    failures: u32,
    resume_at: Option<tokio::time::Instant>,
}

impl AcceptBackoff {
    fn is_paused(&self) -> bool {
        self.resume_at.is_some()
    }

    /// When accepting resumes. Only meaningful while paused.
    fn deadline(&self) -> tokio::time::Instant {
        self.resume_at.unwrap_or_else(tokio::time::Instant::now)
    }

    /// Record a failure and pause. Returns the pause length.
    fn failed(&mut self, now: tokio::time::Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let exponent = self.failures.saturating_sub(1).min(10);
        let delay = ACCEPT_BACKOFF_BASE
            .saturating_mul(1u32 << exponent)
            .min(ACCEPT_BACKOFF_MAX);
        self.resume_at = Some(now + delay);
        delay
    }

    fn resume(&mut self) {
        self.resume_at = None;
    }

    fn succeeded(&mut self) {
        self.failures = 0;
    }
}

/// Run one hub step. A panic is logged and reported as `false` so the
/// caller can still run the shutdown sequence.
fn hub_step(hub: &mut Hub, step: impl FnOnce(&mut Hub)) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| step(hub))) {
        Ok(()) => true,
        Err(payload) => {
            error!(reason = %panic_message(payload.as_ref()), "Hub fault, shutting down");
            false
        }
    }
}

struct Hub {
    registry: Registry<ConnectionHandle>,
    router: Router,
    scheduler: Scheduler,
    settings: ConnectionSettings,
    max_clients: usize,
    model_name: String,
    model_version: u64,
    started: Instant,
    peak_clients: usize,
    state: ServerState,
}

impl Hub {
    fn new(config: &ServerConfig, collaborators: Collaborators) -> Self {
        let now = Instant::now();
        Self {
            registry: Registry::new(),
            router: Router::new(config.router_config(), collaborators),
            scheduler: Scheduler::from_config(&config.schedule, now),
            settings: ConnectionSettings {
                handshake_timeout: config.server.handshake_timeout(),
                max_frame_bytes: config.server.max_frame_bytes,
                outbound_queue: config.server.outbound_queue,
            },
            max_clients: config.server.max_clients,
            model_name: config.schedule.model_name.clone(),
            model_version: 0,
            started: now,
            peak_clients: 0,
            state: ServerState::Listening,
        }
    }

    fn transition(&mut self, next: ServerState) {
        info!(from = ?self.state, to = ?next, "Server state change");
        self.state = next;
    }

    fn handle_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Connected { id, peer, handle } => self.on_connected(id, peer, handle),
            HubEvent::Message { id, text } => {
                if !self.registry.contains(&id) {
                    debug!(client_id = %id, "Message from unregistered client ignored");
                    return;
                }
                let outcome = self.router.dispatch(&mut self.registry, &id, &text);
                debug!(
                    client_id = %id,
                    kind = outcome.kind,
                    reply = outcome.reply,
                    latency_ms = outcome.latency_ms,
                    violations = outcome.violations,
                    "Dispatched"
                );
                self.refresh_gauge();
            }
            HubEvent::Disconnected { id, reason } => {
                if self.registry.unregister(&id).is_some() {
                    Metrics::disconnect(reason.as_str());
                    info!(
                        client_id = %id,
                        reason = reason.as_str(),
                        clients = self.registry.len(),
                        "Client disconnected"
                    );
                }
                self.refresh_gauge();
            }
        }
    }

    fn on_connected(&mut self, id: ClientId, peer: SocketAddr, handle: ConnectionHandle) {
        if self.registry.contains(&id) {
            warn!(client_id = %id, peer = %peer, "Connection refused, id already registered");
            Metrics::connection("rejected_duplicate");
            refuse(
                &handle,
                DUPLICATE_CLIENT,
                format!("Client id {id} is already connected"),
            );
            return;
        }
        if self.registry.len() >= self.max_clients {
            warn!(
                peer = %peer,
                clients = self.registry.len(),
                max = self.max_clients,
                "Connection refused"
            );
            Metrics::connection("rejected_capacity");
            refuse(
                &handle,
                SERVER_FULL,
                format!("Server full ({} clients)", self.max_clients),
            );
            return;
        }

        if let Err(e) = self.registry.register(Client::new(id, handle, peer.to_string())) {
            warn!(client_id = %id, error = %e, "Registration failed");
            return;
        }
        Metrics::connection("accepted");
        self.peak_clients = self.peak_clients.max(self.registry.len());
        info!(
            client_id = %id,
            peer = %peer,
            clients = self.registry.len(),
            "Client connected"
        );

        self.router.welcome_client(&mut self.registry, &id);
        self.refresh_gauge();
    }

    fn run_due_tasks(&mut self, now: Instant) {
        for task in self.scheduler.due(now) {
            let message = match task {
                TaskKind::ComplianceSnapshot => {
                    let report = self.router.compliance_report(self.registry.len());
                    Metrics::compliance_score(report.score);
                    OutboundMessage::ComplianceUpdate(report)
                }
                TaskKind::BroadcastTick => {
                    self.registry.prune_empty_channels();
                    OutboundMessage::AnalyticsSnapshot(self.snapshot())
                }
                TaskKind::ModelRefresh => {
                    self.model_version += 1;
                    OutboundMessage::ModelRefresh(ModelRefresh {
                        model: self.model_name.clone(),
                        version: self.model_version,
                        refreshed_at: Utc::now(),
                    })
                }
            };

            let report = Router::publish(&mut self.registry, task.channel(), &message);
            Metrics::task_run(task.as_str());
            for _ in &report.failed {
                Metrics::disconnect("write_failed");
            }
            debug!(
                task = %task,
                channel = task.channel(),
                delivered = report.delivered.len(),
                failed = report.failed.len(),
                "Scheduled task ran"
            );
        }
        self.refresh_gauge();
    }

    fn snapshot(&self) -> AnalyticsSnapshot {
        let tracker = self.router.tracker();
        AnalyticsSnapshot {
            timestamp: Utc::now().timestamp_millis(),
            uptime_secs: self.started.elapsed().as_secs() as i64,
            connected_clients: self.registry.len(),
            messages_total: tracker.total_requests(),
            messages_by_kind: tracker.requests_by_kind().clone(),
            channels: self.registry.channel_sizes().into_iter().collect(),
        }
    }

    /// Close every client. Returns how many were connected.
    fn close_all(&mut self) -> usize {
        let closed = self.registry.drain();
        for client in &closed {
            Metrics::disconnect("shutdown");
            debug!(client_id = %client.id(), "Closed on shutdown");
        }
        self.refresh_gauge();
        info!(clients = closed.len(), "All clients closed");
        closed.len()
    }

    fn refresh_gauge(&self) {
        Metrics::connected_clients(self.registry.len());
    }
}

/// Send a final `error` envelope to a connection that is not registered,
/// then close it.
fn refuse(handle: &ConnectionHandle, code: &str, message: String) {
    let refusal = OutboundMessage::Error(ErrorBody {
        request_id: None,
        code: code.to_string(),
        message,
        received_type: None,
    });
    if let Ok(payload) = refusal.to_json() {
        let _ = handle.send(encode_text(payload.as_bytes()).into());
    }
    handle.close();
}
