//! Multi-client integration tests
//!
//! Port ownership across clients, disconnects and broker restarts

use super::{
    get_free_port, make_client, start_client, start_echo_server, start_server, wait_until, TOKEN,
};
use portico::{Client, TunnelError};
use std::time::Duration;

#[tokio::test]
async fn test_multiple_clients_route_independently() {
    let (port_a, _echo_a) = start_echo_server().await;
    let (port_b, _echo_b) = start_echo_server().await;
    let server = start_server(|b| b).await;

    let mut client_a = start_client(&server, port_a, 9100).await;
    let mut client_b = start_client(&server, port_b, 9101).await;
    assert_eq!(server.registry().connection_count(), 2);
    assert_eq!(server.registry().list().len(), 2);

    let http = make_client();
    for (public, local) in [(9100, port_a), (9101, port_b)] {
        let body = http
            .get(format!("http://{}/{public}/", server.http_addr()))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap()
            .to_lowercase();
        assert!(body.contains(&format!("host: 127.0.0.1:{local}")), "{body}");
    }

    client_a.shutdown().await.unwrap();
    client_b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_client_on_same_port_is_refused() {
    let (local_port, _echo) = start_echo_server().await;
    let server = start_server(|b| b).await;
    let mut first = start_client(&server, local_port, 9110).await;

    let mut second = Client::builder()
        .server_addr(server.control_addr().to_string())
        .token(TOKEN)
        .local_port(u32::from(local_port))
        .public_port(9110)
        .auto_reconnect(false)
        .build()
        .unwrap();
    let err = second.start().await.unwrap_err();
    assert!(matches!(err, TunnelError::Registration(_)));
    assert!(err.to_string().contains("port already in use"));

    // The original owner still serves the port
    let response = make_client()
        .get(format!("http://{}/9110/", server.http_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);

    first.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_client_disconnect_frees_port() {
    let (local_port, _echo) = start_echo_server().await;
    let server = start_server(|b| b).await;
    let registry = server.registry();

    let mut first = start_client(&server, local_port, 9120).await;
    assert!(registry.lookup_by_public_port(9120).is_ok());
    first.shutdown().await.unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || registry
            .lookup_by_public_port(9120)
            .is_err())
        .await,
        "port was not released"
    );
    assert_eq!(registry.connection_count(), 0);

    let mut second = start_client(&server, local_port, 9120).await;
    assert!(registry.lookup_by_public_port(9120).is_ok());
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_client_reconnects_after_broker_restart() {
    let (local_port, _echo) = start_echo_server().await;
    let control_port = get_free_port();
    let control_bind = format!("127.0.0.1:{control_port}").parse().unwrap();

    let first = start_server(|b| b.control_bind(control_bind)).await;
    let mut client = start_client(&first, local_port, 9130).await;
    first.shutdown().await.unwrap();

    let second = start_server(|b| b.control_bind(control_bind)).await;
    let registry = second.registry();
    assert!(
        wait_until(Duration::from_secs(10), || registry
            .lookup_by_public_port(9130)
            .is_ok())
        .await,
        "client did not re-register"
    );
    assert!(client.is_running());

    let response = make_client()
        .get(format!("http://{}/9130/again", second.http_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);

    client.shutdown().await.unwrap();
}
