//! Wire-level control channel tests against a full broker

use super::{make_client, start_server, TOKEN};
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use portico_protocol::constants::PROTOCOL_VERSION;
use portico_protocol::{
    encode_raw, Decoded, ErrorCode, Frame, HelloStatus, RegisterStatus, ResponseFrame,
    TunnelCodec,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

type Channel = Framed<TcpStream, TunnelCodec>;

async fn open(addr: SocketAddr, id: &str, token: &str) -> (Channel, HelloStatus) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut channel = Framed::new(stream, TunnelCodec::new());
    channel
        .send(Frame::Hello {
            connection_id: id.to_string(),
            version: PROTOCOL_VERSION,
            token: Some(token.to_string()),
        })
        .await
        .unwrap();
    match recv(&mut channel).await {
        Frame::HelloAck { status } => (channel, status),
        other => panic!("expected hello_ack, got {other:?}"),
    }
}

async fn recv(channel: &mut Channel) -> Frame {
    let item = tokio::time::timeout(Duration::from_secs(5), channel.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed")
        .unwrap();
    match item {
        Decoded::Frame(frame) => frame,
        Decoded::Malformed(e) => panic!("broker sent a malformed frame: {e}"),
    }
}

async fn register(channel: &mut Channel, public_port: u32) -> RegisterStatus {
    channel
        .send(Frame::Register {
            local_port: 8000,
            public_port,
            custom_domain: None,
        })
        .await
        .unwrap();
    match recv(channel).await {
        Frame::RegisterResult { status, .. } => status,
        other => panic!("expected register_result, got {other:?}"),
    }
}

async fn send_raw(channel: &mut Channel, payload: &[u8]) {
    let mut buf = BytesMut::new();
    encode_raw(payload, &mut buf).unwrap();
    channel.get_mut().write_all(&buf).await.unwrap();
}

async fn expect_error(channel: &mut Channel, expected: ErrorCode) {
    match recv(channel).await {
        Frame::Error { code, .. } => assert_eq!(code, expected),
        other => panic!("expected error frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_wrong_token_is_rejected() {
    let server = start_server(|b| b).await;
    let (_channel, status) = open(server.control_addr(), "intruder", "wrong").await;
    assert_eq!(status, HelloStatus::InvalidToken);
    assert_eq!(server.registry().connection_count(), 0);
}

#[tokio::test]
async fn test_malformed_frames_do_not_close_connection() {
    let server = start_server(|b| b).await;
    let (mut channel, status) = open(server.control_addr(), "garbled", TOKEN).await;
    assert_eq!(status, HelloStatus::Success);

    send_raw(&mut channel, b"{{{{").await;
    expect_error(&mut channel, ErrorCode::MalformedFrame).await;

    send_raw(&mut channel, br#"{"type":"self_destruct"}"#).await;
    expect_error(&mut channel, ErrorCode::UnknownFrameType).await;

    send_raw(&mut channel, br#"{"type":"register","public_port":9200}"#).await;
    expect_error(&mut channel, ErrorCode::InvalidFrame).await;

    assert_eq!(register(&mut channel, 9200).await, RegisterStatus::Success);
    assert!(server.registry().lookup_by_public_port(9200).is_ok());
}

#[tokio::test]
async fn test_duplicate_connection_id_is_rejected() {
    let server = start_server(|b| b).await;
    let (mut first, status) = open(server.control_addr(), "same-id", TOKEN).await;
    assert_eq!(status, HelloStatus::Success);

    let (_second, status) = open(server.control_addr(), "same-id", TOKEN).await;
    assert_eq!(status, HelloStatus::ConnectionIdTaken);

    assert_eq!(register(&mut first, 9210).await, RegisterStatus::Success);
    assert_eq!(server.registry().connection_count(), 1);
}

#[tokio::test]
async fn test_invalid_ports_and_second_registration() {
    let server = start_server(|b| b).await;
    let (mut channel, _) = open(server.control_addr(), "ranges", TOKEN).await;

    assert_eq!(register(&mut channel, 0).await, RegisterStatus::InvalidPort);
    assert_eq!(register(&mut channel, 65536).await, RegisterStatus::InvalidPort);
    assert_eq!(register(&mut channel, 65535).await, RegisterStatus::Success);
    assert_eq!(
        register(&mut channel, 9220).await,
        RegisterStatus::AlreadyRegistered
    );
    assert!(server.registry().lookup_by_public_port(9220).is_err());
}

#[tokio::test]
async fn test_request_and_response_travel_over_control_channel() {
    let server = start_server(|b| b).await;
    let (mut channel, _) = open(server.control_addr(), "manual", TOKEN).await;
    assert_eq!(register(&mut channel, 9230).await, RegisterStatus::Success);

    let url = format!("http://{}/9230/orders?id=7", server.http_addr());
    let public = tokio::spawn(async move {
        make_client()
            .post(url)
            .header("X-Client", "raw")
            .body("ping")
            .send()
            .await
            .unwrap()
    });

    loop {
        match recv(&mut channel).await {
            Frame::Probe { probe_id } => {
                channel
                    .send(Frame::ProbeResult {
                        probe_id,
                        reachable: true,
                        error: None,
                    })
                    .await
                    .unwrap();
            }
            Frame::Request(request) => {
                assert_eq!(request.method, "POST");
                assert_eq!(request.path, "/orders?id=7");
                assert_eq!(request.body, Bytes::from_static(b"ping"));
                assert!(request
                    .headers
                    .iter()
                    .any(|(k, v)| k.eq_ignore_ascii_case("x-client") && v == "raw"));
                assert!(!request.headers.iter().any(|(k, _)| {
                    k.eq_ignore_ascii_case("host") || k.eq_ignore_ascii_case("content-length")
                }));

                channel
                    .send(Frame::Response(Box::new(ResponseFrame {
                        request_id: request.request_id,
                        status: 202,
                        headers: vec![("x-handled-by".to_string(), "raw".to_string())],
                        body: Bytes::from_static(b"pong"),
                        error: None,
                    })))
                    .await
                    .unwrap();
                break;
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    let response = public.await.unwrap();
    assert_eq!(response.status().as_u16(), 202);
    assert_eq!(response.headers().get("x-handled-by").unwrap(), "raw");
    assert_eq!(response.text().await.unwrap(), "pong");
}

#[tokio::test]
async fn test_unreachable_probe_result_is_502() {
    let server = start_server(|b| b).await;
    let (mut channel, _) = open(server.control_addr(), "down", TOKEN).await;
    assert_eq!(register(&mut channel, 9240).await, RegisterStatus::Success);

    let url = format!("http://{}/9240/", server.http_addr());
    let public = tokio::spawn(async move { make_client().get(url).send().await.unwrap() });

    match recv(&mut channel).await {
        Frame::Probe { probe_id } => channel
            .send(Frame::ProbeResult {
                probe_id,
                reachable: false,
                error: Some("connection refused".to_string()),
            })
            .await
            .unwrap(),
        other => panic!("expected probe, got {other:?}"),
    }

    let response = public.await.unwrap();
    assert_eq!(response.status().as_u16(), 502);
}

#[tokio::test]
async fn test_heartbeat_is_acknowledged() {
    let server = start_server(|b| b).await;
    let (mut channel, _) = open(server.control_addr(), "pulse", TOKEN).await;
    assert_eq!(register(&mut channel, 9250).await, RegisterStatus::Success);

    channel
        .send(Frame::Heartbeat { timestamp: 42 })
        .await
        .unwrap();
    assert_eq!(
        recv(&mut channel).await,
        Frame::HeartbeatAck { timestamp: 42 }
    );
}
