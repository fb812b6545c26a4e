//! Control channel frame definitions
//!
//! Every frame is a JSON object whose `type` field names the variant.
//! Bodies travel as base64 strings. Header values are byte strings carried
//! one `char` per byte, so values that are not UTF-8 survive the trip.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire protocol frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    // Session setup
    /// Opens a control connection under a client chosen id
    Hello {
        connection_id: String,
        version: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Broker answer to `Hello`
    HelloAck { status: HelloStatus },

    /// Ask the broker to expose `local_port` under `public_port`
    Register {
        local_port: u32,
        public_port: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        custom_domain: Option<String>,
    },

    /// Registration outcome
    RegisterResult {
        status: RegisterStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tunnel_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    // Relayed traffic
    /// A public request the client must execute locally
    Request(Box<RequestFrame>),

    /// The local service's answer to a `Request`
    Response(Box<ResponseFrame>),

    /// Liveness check of the client's local service
    Probe { probe_id: u64 },

    /// Answer to `Probe`
    ProbeResult {
        probe_id: u64,
        reachable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // Keepalive
    /// Heartbeat ping
    Heartbeat { timestamp: u64 },

    /// Heartbeat acknowledgment
    HeartbeatAck { timestamp: u64 },

    /// Informational message pushed by the broker
    Notice { message: String },

    /// Protocol level complaint about a previous frame
    Error { code: ErrorCode, message: String },
}

impl Frame {
    /// Every `type` discriminator this protocol version understands
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "hello",
        "hello_ack",
        "register",
        "register_result",
        "request",
        "response",
        "probe",
        "probe_result",
        "heartbeat",
        "heartbeat_ack",
        "notice",
        "error",
    ];

    /// The `type` discriminator this frame is encoded with
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::HelloAck { .. } => "hello_ack",
            Frame::Register { .. } => "register",
            Frame::RegisterResult { .. } => "register_result",
            Frame::Request(_) => "request",
            Frame::Response(_) => "response",
            Frame::Probe { .. } => "probe",
            Frame::ProbeResult { .. } => "probe_result",
            Frame::Heartbeat { .. } => "heartbeat",
            Frame::HeartbeatAck { .. } => "heartbeat_ack",
            Frame::Notice { .. } => "notice",
            Frame::Error { .. } => "error",
        }
    }

    /// A successful registration result
    pub fn register_success(tunnel_id: Uuid) -> Self {
        Frame::RegisterResult {
            status: RegisterStatus::Success,
            tunnel_id: Some(tunnel_id),
            reason: None,
        }
    }

    /// A failed registration result carrying the status' reason text
    pub fn register_failure(status: RegisterStatus) -> Self {
        Frame::RegisterResult {
            status,
            tunnel_id: None,
            reason: Some(status.reason().to_string()),
        }
    }
}

/// A public HTTP request forwarded down the control channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestFrame {
    pub request_id: u64,
    pub method: String,
    /// Path including the query string
    pub path: String,
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "base64_body")]
    pub body: Bytes,
}

/// The local service's response, correlated by `request_id`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseFrame {
    pub request_id: u64,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "base64_body")]
    pub body: Bytes,
    /// Set when the client could not reach its local service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseFrame {
    /// Synthetic 500 reporting a failed local call.
    ///
    /// The broker turns any response with `error` set into a 502.
    pub fn failure(request_id: u64, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            request_id,
            status: 500,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: Bytes::from(message.clone()),
            error: Some(message),
        }
    }
}

/// Map raw header value bytes to their wire form
pub fn header_value_to_wire(value: &[u8]) -> String {
    value.iter().map(|&b| char::from(b)).collect()
}

/// Inverse of [`header_value_to_wire`]; `None` if a char is above U+00FF
pub fn header_value_from_wire(value: &str) -> Option<Vec<u8>> {
    value.chars().map(|c| u8::try_from(c).ok()).collect()
}

mod base64_body {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Handshake status codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HelloStatus {
    Success,
    InvalidToken,
    InvalidConnectionId,
    ConnectionIdTaken,
    UnsupportedVersion,
}

/// Registration status codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegisterStatus {
    Success,
    PortInUse,
    DomainInUse,
    InvalidPort,
    AlreadyRegistered,
}

impl RegisterStatus {
    /// Human readable reason sent alongside a failed registration
    pub fn reason(self) -> &'static str {
        match self {
            RegisterStatus::Success => "success",
            RegisterStatus::PortInUse => "port already in use",
            RegisterStatus::DomainInUse => "domain already in use",
            RegisterStatus::InvalidPort => "invalid port range",
            RegisterStatus::AlreadyRegistered => "tunnel already registered on this connection",
        }
    }
}

/// Error codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MalformedFrame,
    UnknownFrameType,
    InvalidFrame,
    UnexpectedFrame,
    UnknownRequest,
}
