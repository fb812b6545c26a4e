//! End-to-end relay through a registered client

use super::{make_client, start_client, start_echo_server, start_server, start_sink_server, TOKEN};
use portico::Client;
use reqwest::StatusCode;

#[tokio::test]
async fn test_request_reaches_local_service_by_public_port() {
    let (local_port, _echo) = start_echo_server().await;
    let server = start_server(|b| b).await;
    let mut client = start_client(&server, local_port, 9000).await;

    let response = make_client()
        .get(format!("http://{}/9000/status?verbose=1", server.http_addr()))
        .header("X-Trace", "abc123")
        .header("Keep-Alive", "timeout=5")
        .send()
        .await
        .expect("request failed");

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers().get("x-local").unwrap(), "yes");

    let body = response.text().await.unwrap().to_lowercase();
    assert!(
        body.starts_with("get /status?verbose=1 http/1.1\r\n"),
        "unexpected request line: {body}"
    );
    assert!(body.contains("x-trace: abc123"));
    assert!(body.contains(&format!("host: 127.0.0.1:{local_port}")));
    assert!(!body.contains("keep-alive"));
    assert_eq!(body.matches("\r\nhost:").count(), 1);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_request_routed_by_custom_domain() {
    let (local_port, _echo) = start_echo_server().await;
    let server = start_server(|b| b).await;

    let mut client = Client::builder()
        .server_addr(server.control_addr().to_string())
        .token(TOKEN)
        .local_port(u32::from(local_port))
        .public_port(9010)
        .custom_domain("App.Example.test")
        .build()
        .unwrap();
    let info = client.start().await.unwrap();
    assert_eq!(info.custom_domain.as_deref(), Some("App.Example.test"));

    let response = make_client()
        .get(format!("http://{}/9999/hello", server.http_addr()))
        .header("Host", "app.example.test")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    // Domain routes forward the path untouched
    let body = response.text().await.unwrap().to_lowercase();
    assert!(body.starts_with("get /9999/hello http/1.1\r\n"), "{body}");

    let by_port = server.registry().lookup_by_public_port(9010).unwrap();
    let by_domain = server.registry().lookup_by_domain("app.example.test").unwrap();
    assert_eq!(by_port.tunnel_id, by_domain.tunnel_id);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_requests_are_correlated() {
    let (local_port, _echo) = start_echo_server().await;
    let server = start_server(|b| b).await;
    let mut client = start_client(&server, local_port, 9020).await;

    let http = make_client();
    let mut handles = Vec::new();
    for i in 0..20 {
        let http = http.clone();
        let url = format!("http://{}/9020/item/{i}", server.http_addr());
        handles.push(tokio::spawn(async move {
            let body = http.get(url).send().await.unwrap().text().await.unwrap();
            (i, body)
        }));
    }

    for handle in handles {
        let (i, body) = handle.await.unwrap();
        assert!(
            body.starts_with(&format!("GET /item/{i} HTTP/1.1\r\n")),
            "request {i} got {body}"
        );
    }

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_multi_megabyte_binary_upload() {
    let (local_port, _sink) = start_sink_server().await;
    let server = start_server(|b| b).await;
    let mut client = start_client(&server, local_port, 9003).await;
    let url = format!("http://{}/9003/upload", server.http_addr());

    let size = 6 * 1024 * 1024;
    let response = make_client()
        .post(&url)
        .body(vec![0xFF_u8; size])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), size.to_string());

    // The same control connection keeps serving
    let response = make_client().get(&url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "0");
    assert!(client.is_running());

    client.shutdown().await.unwrap();
}
