//! Shared helpers for end-to-end tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use beacon_router::Collaborators;
use beacon_server::{Server, ServerConfig, ServerResult};
use beacon_telemetry::SessionSummary;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<ServerResult<SessionSummary>>,
}

impl TestServer {
    /// Stop the server and wait for its summary.
    pub async fn stop(self) -> SessionSummary {
        self.shutdown.cancel();
        tokio::time::timeout(RECV_TIMEOUT, self.handle)
            .await
            .expect("server did not stop")
            .expect("server task panicked")
            .expect("server returned an error")
    }
}

/// Start a server on an ephemeral port. Scheduled tasks are disabled unless
/// `configure` turns them on.
pub async fn start_server(configure: impl FnOnce(&mut ServerConfig)) -> TestServer {
    start_server_with(configure, Collaborators::builtin()).await
}

/// Like [`start_server`], with the given collaborators.
pub async fn start_server_with(
    configure: impl FnOnce(&mut ServerConfig),
    collaborators: Collaborators,
) -> TestServer {
    let mut config = ServerConfig::default();
    config.server.bind_addr = "127.0.0.1:0".to_string();
    config.server.poll_interval_ms = 10;
    config.schedule.compliance_interval_secs = 0;
    config.schedule.broadcast_interval_secs = 0;
    config.schedule.model_refresh_interval_secs = 0;
    configure(&mut config);

    let server = Server::bind_with(config, collaborators)
        .await
        .expect("bind failed");
    let addr = server.local_addr();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(server.run(shutdown.clone()));
    TestServer {
        addr,
        shutdown,
        handle,
    }
}

/// Connect and consume the welcome envelope.
pub async fn connect(addr: SocketAddr) -> (Ws, Value) {
    let (mut ws, _response) = connect_async(format!("ws://{addr}/"))
        .await
        .expect("websocket connect failed");
    let welcome = next_json(&mut ws).await;
    assert_eq!(welcome["type"], "academic_welcome");
    (ws, welcome)
}

pub async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string()))
        .await
        .expect("send failed");
}

pub async fn send_text(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.to_string()))
        .await
        .expect("send failed");
}

/// Next text message as JSON.
pub async fn next_json(ws: &mut Ws) -> Value {
    next_json_within(ws, RECV_TIMEOUT)
        .await
        .expect("no message before timeout")
}

/// Next text message, or `None` if nothing arrives in `wait`.
pub async fn next_json_within(ws: &mut Ws, wait: Duration) -> Option<Value> {
    let read = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<Value>(&text).expect("invalid JSON from server")
                }
                Some(Ok(Message::Close(_))) | None => panic!("connection closed"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("read error: {e}"),
            }
        }
    };
    tokio::time::timeout(wait, read).await.ok()
}

/// Wait for the server to end the connection.
pub async fn expect_closed(ws: &mut Ws) {
    let read = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    };
    tokio::time::timeout(RECV_TIMEOUT, read)
        .await
        .expect("connection was not closed");
}

/// Poll `compliance_check` until the server reports `expected` clients.
pub async fn wait_for_clients(ws: &mut Ws, expected: u64) -> Value {
    for _ in 0..100 {
        send_json(ws, serde_json::json!({"type": "compliance_check"})).await;
        let report = next_json(ws).await;
        assert_eq!(report["type"], "compliance_update");
        if report["data"]["connected_clients"] == expected {
            return report;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server never reported {expected} clients");
}
