//! Failure mapping of the public relay

use super::{
    dead_port, make_client, start_client, start_echo_server, start_server, start_silent_server,
    start_sink_server,
};
use portico::LimitsConfig;
use reqwest::StatusCode;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_unknown_public_port_is_404() {
    let (local_port, _echo) = start_echo_server().await;
    let server = start_server(|b| b).await;
    let mut client = start_client(&server, local_port, 9000).await;

    let response = make_client()
        .get(format!("http://{}/9001/status", server.http_addr()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.text().await.unwrap().contains("tunnel not found"));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_path_without_port_is_404() {
    let server = start_server(|b| b).await;

    let response = make_client()
        .get(format!("http://{}/status", server.http_addr()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_local_service_down_is_502_before_forward_timeout() {
    let server = start_server(|b| b.forward_timeout(Duration::from_secs(10))).await;
    let mut client = start_client(&server, dead_port(), 9030).await;

    let started = Instant::now();
    let response = make_client()
        .get(format!("http://{}/9030/status", server.http_addr()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(started.elapsed() < Duration::from_secs(5));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_local_failure_without_liveness_check_is_502() {
    let server = start_server(|b| b.probe(false)).await;
    let mut client = start_client(&server, dead_port(), 9031).await;

    let response = make_client()
        .get(format!("http://{}/9031/status", server.http_addr()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(response
        .text()
        .await
        .unwrap()
        .starts_with("upstream error: local service unreachable"));

    // The control channel survives the failed call
    assert!(client.is_running());
    assert_eq!(server.registry().connection_count(), 1);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_slow_local_service_is_504() {
    let (local_port, _silent) = start_silent_server().await;
    let server = start_server(|b| b.forward_timeout(Duration::from_millis(500))).await;
    let mut client = start_client(&server, local_port, 9032).await;

    let started = Instant::now();
    let response = make_client()
        .get(format!("http://{}/9032/slow", server.http_addr()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(started.elapsed() < Duration::from_secs(5));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_body_over_frame_limit_is_413_and_tunnel_survives() {
    let (local_port, _sink) = start_sink_server().await;
    let limits = LimitsConfig {
        max_frame_bytes: 1024 * 1024,
        ..LimitsConfig::default()
    };
    let server = start_server(|b| b.limits(limits)).await;
    let mut client = start_client(&server, local_port, 9033).await;
    let url = format!("http://{}/9033/upload", server.http_addr());

    let response = make_client()
        .post(&url)
        .body(vec![0xFF_u8; 2 * 1024 * 1024])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let response = make_client().post(&url).body("small").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "5");
    assert!(client.is_running());
    assert_eq!(server.registry().connection_count(), 1);

    client.shutdown().await.unwrap();
}
