//! Per-connection tasks.
//!
//! Each accepted socket gets one task that performs the handshake and then
//! reads frames, plus a writer task fed by a bounded queue. The hub only
//! sees [`HubEvent`]s and a [`ConnectionHandle`]; it never touches the socket.

use std::net::SocketAddr;
use std::time::Duration;

use beacon_registry::{ClientId, FrameBytes, Transport, TransportError};
use beacon_telemetry::Metrics;
use beacon_ws::{accept, FrameReader, FrameWriter, Inbound};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer sent a close frame.
    PeerClosed,
    /// Stream ended on a frame boundary.
    Eof,
    /// Malformed, unmasked, oversized or truncated frame.
    ProtocolError,
    Io,
    /// Closed from the server side.
    Closed,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::Eof => "eof",
            Self::ProtocolError => "protocol_error",
            Self::Io => "io_error",
            Self::Closed => "closed",
        }
    }
}

/// Events sent from connection tasks to the hub, in per-connection order.
#[derive(Debug)]
pub enum HubEvent {
    Connected {
        id: ClientId,
        peer: SocketAddr,
        handle: ConnectionHandle,
    },
    Message {
        id: ClientId,
        text: String,
    },
    Disconnected {
        id: ClientId,
        reason: DisconnectReason,
    },
}

/// Outbound side of a connection, owned by the registry.
#[derive(Debug)]
pub struct ConnectionHandle {
    frames: mpsc::Sender<FrameBytes>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(frames: mpsc::Sender<FrameBytes>, cancel: CancellationToken) -> Self {
        Self { frames, cancel }
    }
}

impl Transport for ConnectionHandle {
    fn send(&self, frame: FrameBytes) -> Result<(), TransportError> {
        self.frames.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// Per-connection limits.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub handshake_timeout: Duration,
    pub max_frame_bytes: usize,
    pub outbound_queue: usize,
}

/// Drive one accepted socket from handshake to disconnect.
pub async fn run_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    settings: ConnectionSettings,
    events: mpsc::Sender<HubEvent>,
    shutdown: CancellationToken,
) {
    let handshake = tokio::select! {
        _ = shutdown.cancelled() => return,
        result = accept(&mut stream, settings.handshake_timeout) => result,
    };
    let handshake = match handshake {
        Ok(handshake) => handshake,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Handshake failed");
            Metrics::connection("handshake_failed");
            return;
        }
    };

    let id = ClientId::generate();
    let cancel = shutdown.child_token();
    let (frame_tx, frame_rx) = mpsc::channel(settings.outbound_queue);
    let handle = ConnectionHandle::new(frame_tx, cancel.clone());
    if events
        .send(HubEvent::Connected { id, peer, handle })
        .await
        .is_err()
    {
        debug!(peer = %peer, "Hub gone, dropping connection");
        return;
    }

    let (read_half, write_half) = stream.into_split();
    let writer = tokio::spawn(write_loop(FrameWriter::new(write_half), frame_rx, cancel.clone()));

    let mut reader = FrameReader::with_leftover(read_half, handshake.leftover, settings.max_frame_bytes);
    let reason = read_loop(&mut reader, id, &events, &cancel).await;
    info!(client_id = %id, peer = %peer, reason = reason.as_str(), "Connection ended");

    let _ = events.send(HubEvent::Disconnected { id, reason }).await;
    cancel.cancel();
    let _ = writer.await;
}

async fn read_loop<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    id: ClientId,
    events: &mpsc::Sender<HubEvent>,
    cancel: &CancellationToken,
) -> DisconnectReason {
    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => return DisconnectReason::Closed,
            inbound = reader.next_inbound() => inbound,
        };

        match inbound {
            Ok(Some(Inbound::Text(text))) => {
                if events.send(HubEvent::Message { id, text }).await.is_err() {
                    return DisconnectReason::Closed;
                }
            }
            Ok(Some(Inbound::Close)) => return DisconnectReason::PeerClosed,
            Ok(Some(Inbound::Dropped { opcode, reason })) => {
                debug!(client_id = %id, opcode = %opcode, reason = reason.as_str(), "Frame dropped");
                Metrics::frame_dropped(reason.as_str());
            }
            Ok(None) => return DisconnectReason::Eof,
            Err(e) if e.is_protocol_error() => {
                warn!(client_id = %id, error = %e, "Protocol error, dropping connection");
                return DisconnectReason::ProtocolError;
            }
            Err(e) => {
                debug!(client_id = %id, error = %e, "Read failed");
                return DisconnectReason::Io;
            }
        }
    }
}

/// Write queued frames until the queue closes or the connection is
/// cancelled. Frames already queued at cancellation are still flushed.
async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut frames: mpsc::Receiver<FrameBytes>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.write_frame(&frame).await {
                        debug!(error = %e, "Write failed");
                        cancel.cancel();
                        break;
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                while let Ok(frame) = frames.try_recv() {
                    if writer.write_frame(&frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}
