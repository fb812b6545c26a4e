//! Admin API over real HTTP

use super::{
    loopback, make_client, start_client, start_echo_server, start_server, wait_until, ADMIN_TOKEN,
};
use portico::RunningServer;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

async fn start_with_admin() -> RunningServer {
    start_server(|b| b.admin_bind(loopback()).admin_token(ADMIN_TOKEN)).await
}

fn admin_url(server: &RunningServer, path: &str) -> String {
    format!("http://{}{path}", server.admin_addr().unwrap())
}

#[tokio::test]
async fn test_health_is_public_and_tunnels_require_token() {
    let server = start_with_admin().await;
    let http = make_client();

    let health = http.get(admin_url(&server, "/health")).send().await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(health.text().await.unwrap(), "OK");

    let anonymous = http.get(admin_url(&server, "/tunnels")).send().await.unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        anonymous.headers().get("www-authenticate").unwrap(),
        "Bearer"
    );

    let wrong = http
        .get(admin_url(&server, "/tunnels"))
        .bearer_auth("nope")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_static_tunnel_lifecycle() {
    let (local_port, _echo) = start_echo_server().await;
    let server = start_server(|b| {
        b.admin_bind(loopback())
            .admin_token(ADMIN_TOKEN)
            .static_upstream_host("127.0.0.1")
    })
    .await;
    let http = make_client();

    let created = http
        .post(admin_url(&server, "/tunnels"))
        .bearer_auth(ADMIN_TOKEN)
        .json(&json!({ "local_port": local_port, "public_port": 9300 }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let created: Value = created.json().await.unwrap();
    assert_eq!(created["public_port"], 9300);
    let tunnel_id = created["tunnel_id"].as_str().unwrap().to_string();

    // The broker dials the static mapping itself
    let relayed = http
        .get(format!("http://{}/9300/direct", server.http_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(relayed.status(), StatusCode::CREATED);
    assert!(relayed
        .text()
        .await
        .unwrap()
        .starts_with("GET /direct HTTP/1.1\r\n"));

    let conflict = http
        .post(admin_url(&server, "/tunnels"))
        .bearer_auth(ADMIN_TOKEN)
        .json(&json!({ "local_port": local_port, "public_port": 9300 }))
        .send()
        .await
        .unwrap();
    assert_eq!(conflict.status(), StatusCode::CONFLICT);

    let invalid = http
        .post(admin_url(&server, "/tunnels"))
        .bearer_auth(ADMIN_TOKEN)
        .json(&json!({ "local_port": 0, "public_port": 9301 }))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

    let listed: Value = http
        .get(admin_url(&server, "/tunnels"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let revoked = http
        .delete(admin_url(&server, &format!("/tunnels/{tunnel_id}")))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(revoked.status(), StatusCode::OK);
    let revoked: Value = revoked.json().await.unwrap();
    assert_eq!(revoked["status"], "revoked");
    assert_eq!(revoked["tunnel_id"], tunnel_id.as_str());

    let again = http
        .delete(admin_url(&server, &format!("/tunnels/{tunnel_id}")))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::NOT_FOUND);

    let gone = http
        .get(format!("http://{}/9300/direct", server.http_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_status_and_revoking_client_tunnel() {
    let (local_port, _echo) = start_echo_server().await;
    let server = start_with_admin().await;
    let mut client = start_client(&server, local_port, 9310).await;
    let http = make_client();

    let status: Value = http
        .get(admin_url(&server, "/status"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["active_connections"], 1);
    let tunnel_id = status["tunnels"][0]["tunnel_id"]
        .as_str()
        .unwrap()
        .to_string();

    let revoked = http
        .delete(admin_url(&server, &format!("/tunnels/{tunnel_id}")))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(revoked.status(), StatusCode::OK);

    // The tunnel is gone but the control connection stays up
    let registry = server.registry();
    assert!(registry.lookup_by_public_port(9310).is_err());
    assert!(
        wait_until(Duration::from_millis(500), || registry.connection_count() == 1).await
    );
    assert!(client.is_running());

    client.shutdown().await.unwrap();
}
