//! End-to-end tests over real sockets.

mod common;

use std::time::Duration;

use beacon_router::{Collaborators, ItemDescription, Prediction, PredictionService, ServiceError};
use common::*;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn test_welcome_lists_defaults_without_subscribing() {
    let server = start_server(|_| {}).await;

    let (_ws, welcome) = connect(server.addr).await;

    let data = &welcome["data"];
    assert_eq!(data["server"], "beacon");
    assert_eq!(data["default_channels"], json!(["metrics", "alerts"]));
    assert_eq!(data["subscribed"], json!([]));
    assert_eq!(data["client_id"].as_str().unwrap().len(), 36);
    assert!(data["message_types"]
        .as_array()
        .unwrap()
        .contains(&json!("category_request")));

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_type_gets_error_and_connection_survives() {
    let server = start_server(|_| {}).await;
    let (mut ws, _) = connect(server.addr).await;

    send_json(&mut ws, json!({"type": "bogus", "request_id": "x1", "data": {}})).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["data"]["code"], "unknown_type");
    assert_eq!(reply["data"]["received_type"], "bogus");
    assert_eq!(reply["data"]["request_id"], "x1");

    send_text(&mut ws, "{definitely not json").await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["data"]["code"], "malformed_json");

    send_json(&mut ws, json!({"type": "heartbeat", "request_id": "hb", "timestamp": 1})).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "heartbeat_response");
    assert_eq!(reply["data"]["request_id"], "hb");

    server.stop().await;
}

#[tokio::test]
async fn test_scheduled_publish_reaches_only_subscribers() {
    let server = start_server(|config| {
        config.schedule.compliance_interval_secs = 1;
    })
    .await;
    let (mut subscriber, _) = connect(server.addr).await;
    let (mut bystander, _) = connect(server.addr).await;

    send_json(
        &mut subscriber,
        json!({"type": "subscribe", "request_id": "s1", "data": {"channel": "metrics"}}),
    )
    .await;
    let ack = next_json(&mut subscriber).await;
    assert_eq!(ack["type"], "subscription_confirmed");
    assert_eq!(ack["data"]["request_id"], "s1");

    let update = next_json(&mut subscriber).await;
    assert_eq!(update["type"], "compliance_update");
    assert_eq!(update["data"]["connected_clients"], 2);

    assert!(next_json_within(&mut bystander, Duration::from_millis(1500))
        .await
        .is_none());

    server.stop().await;
}

#[tokio::test]
async fn test_category_request_with_builtin_classifier() {
    let server = start_server(|_| {}).await;
    let (mut ws, _) = connect(server.addr).await;

    send_json(
        &mut ws,
        json!({
            "type": "category_request",
            "request_id": "c1",
            "data": {"item": {"title": "Organic chemistry textbook", "tags": ["isbn"]}}
        }),
    )
    .await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "category_response");
    assert_eq!(reply["data"]["request_id"], "c1");
    assert_eq!(reply["data"]["result"]["label"], "textbooks");
    assert_eq!(reply["data"]["metric"]["name"], "accuracy");
    assert!(reply["data"]["latency_ms"].as_f64().unwrap() >= 0.0);

    send_json(&mut ws, json!({"type": "category_request", "data": {"item": {}}})).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["data"]["code"], "missing_field");

    server.stop().await;
}

struct FailingClassifier;

impl PredictionService for FailingClassifier {
    fn predict(&self, _item: &ItemDescription) -> Result<Prediction, ServiceError> {
        panic!("classifier crashed")
    }
}

#[tokio::test]
async fn test_collaborator_panic_answers_error_and_server_keeps_running() {
    let collaborators = Collaborators {
        prediction: Box::new(FailingClassifier),
        ..Collaborators::builtin()
    };
    let server = start_server_with(|_| {}, collaborators).await;
    let (mut ws, _) = connect(server.addr).await;

    send_json(
        &mut ws,
        json!({"type": "category_request", "request_id": "c9", "data": {"item": {"title": "Lab goggles"}}}),
    )
    .await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["data"]["code"], "service_error");
    assert_eq!(reply["data"]["request_id"], "c9");

    send_json(&mut ws, json!({"type": "heartbeat", "request_id": "after"})).await;
    assert_eq!(next_json(&mut ws).await["type"], "heartbeat_response");

    let summary = server.stop().await;
    assert_eq!(summary.clients_at_shutdown, 1);
    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn test_disconnect_removes_client() {
    let server = start_server(|_| {}).await;
    let (mut observer, _) = connect(server.addr).await;
    let (mut leaver, _) = connect(server.addr).await;

    send_json(&mut leaver, json!({"type": "subscribe", "data": {"channel": "alerts"}})).await;
    next_json(&mut leaver).await;
    wait_for_clients(&mut observer, 2).await;

    leaver.close(None).await.unwrap();
    drop(leaver);

    wait_for_clients(&mut observer, 1).await;
    server.stop().await;
}

#[tokio::test]
async fn test_handshake_without_key_is_rejected() {
    let server = start_server(|_| {}).await;

    let mut raw = TcpStream::connect(server.addr).await.unwrap();
    raw.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(RECV_TIMEOUT, raw.read_to_end(&mut response))
        .await
        .expect("server kept the socket open")
        .unwrap();
    assert!(!String::from_utf8_lossy(&response).starts_with("HTTP/1.1 101"));

    let (mut ws, _) = connect(server.addr).await;
    wait_for_clients(&mut ws, 1).await;

    server.stop().await;
}

#[tokio::test]
async fn test_capacity_limit_refuses_extra_client() {
    let server = start_server(|config| {
        config.server.max_clients = 1;
    })
    .await;
    let (mut first, _) = connect(server.addr).await;

    let (mut second, _response) = tokio_tungstenite::connect_async(format!("ws://{}/", server.addr))
        .await
        .unwrap();
    let refusal = next_json(&mut second).await;
    assert_eq!(refusal["type"], "error");
    assert_eq!(refusal["data"]["code"], "server_full");
    expect_closed(&mut second).await;

    wait_for_clients(&mut first, 1).await;
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_clients_and_reports() {
    let server = start_server(|_| {}).await;
    let (mut a, _) = connect(server.addr).await;
    let (mut b, _) = connect(server.addr).await;
    wait_for_clients(&mut a, 2).await;

    let summary = server.stop().await;

    assert_eq!(summary.clients_at_shutdown, 2);
    assert!(summary.peak_clients >= 2);
    expect_closed(&mut a).await;
    expect_closed(&mut b).await;
}
