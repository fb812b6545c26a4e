//! Administrative HTTP API
//!
//! JSON over axum. Every route except `/health` goes through
//! [`require_auth`], which asks the configured [`Authorizer`].

use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use portico_common::Result;
use portico_core::auth::{hash_token, verify_token_hash};
use portico_core::{RegistrationError, Tunnel, TunnelRegistry};
use portico_protocol::Frame;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Who made an authorized admin call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingCredentials,
    #[error("invalid bearer token")]
    InvalidCredentials,
}

/// Decides whether an admin request may proceed
pub trait Authorizer: Send + Sync {
    fn authorize(&self, headers: &HeaderMap) -> std::result::Result<Identity, AuthError>;
}

/// Accepts exactly one static bearer token. Only its hash is kept.
pub struct BearerTokenAuthorizer {
    token_hash: [u8; 32],
}

impl BearerTokenAuthorizer {
    pub fn new(token: &str) -> Self {
        Self {
            token_hash: hash_token(token),
        }
    }
}

impl Authorizer for BearerTokenAuthorizer {
    fn authorize(&self, headers: &HeaderMap) -> std::result::Result<Identity, AuthError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or(AuthError::MissingCredentials)?;

        if verify_token_hash(token, &self.token_hash) {
            Ok(Identity {
                subject: "admin".to_string(),
            })
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }
}

/// Shared state for admin handlers
pub struct AdminState {
    pub registry: Arc<TunnelRegistry>,
    pub authorizer: Arc<dyn Authorizer>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateTunnelRequest {
    pub local_port: u32,
    pub public_port: u32,
    #[serde(default)]
    pub custom_domain: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTunnelResponse {
    pub tunnel_id: Uuid,
    pub public_port: u16,
    pub custom_domain: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RevokeResponse {
    pub status: String,
    pub tunnel_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub active_connections: usize,
    pub tunnels: Vec<Tunnel>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn registration_error(err: &RegistrationError) -> ApiError {
    let status = match err {
        RegistrationError::InvalidPort(_) => StatusCode::BAD_REQUEST,
        RegistrationError::PortInUse(_) | RegistrationError::DomainInUse(_) => {
            StatusCode::CONFLICT
        }
        RegistrationError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, err.to_string())
}

/// Build the admin router with its auth layer
pub fn router(state: Arc<AdminState>) -> Router {
    let protected = Router::new()
        .route("/tunnels", get(list_tunnels).post(create_tunnel))
        .route("/tunnels/{tunnel_id}", delete(revoke_tunnel))
        .route("/status", get(status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
}

/// Rejects the request with 401 unless the authorizer accepts it
pub async fn require_auth(
    State(state): State<Arc<AdminState>>,
    mut request: Request,
    next: Next,
) -> Response {
    match state.authorizer.authorize(request.headers()) {
        Ok(identity) => {
            debug!("Admin request {} by {}", request.uri().path(), identity.subject);
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(err) => {
            warn!("Rejected admin request to {}: {}", request.uri().path(), err);
            (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                Json(ErrorResponse {
                    error: err.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn create_tunnel(
    State(state): State<Arc<AdminState>>,
    Json(body): Json<CreateTunnelRequest>,
) -> std::result::Result<(StatusCode, Json<CreateTunnelResponse>), ApiError> {
    let tunnel = state
        .registry
        .register_static(body.local_port, body.public_port, body.custom_domain.as_deref())
        .map_err(|e| registration_error(&e))?;

    Ok((
        StatusCode::CREATED,
        Json(CreateTunnelResponse {
            tunnel_id: tunnel.tunnel_id,
            public_port: tunnel.public_port,
            custom_domain: tunnel.custom_domain,
        }),
    ))
}

async fn list_tunnels(State(state): State<Arc<AdminState>>) -> Json<Vec<Tunnel>> {
    Json(state.registry.list())
}

async fn revoke_tunnel(
    State(state): State<Arc<AdminState>>,
    Path(tunnel_id): Path<Uuid>,
) -> std::result::Result<Json<RevokeResponse>, ApiError> {
    let tunnel = state
        .registry
        .revoke(tunnel_id)
        .map_err(|e| registration_error(&e))?;

    // The connection stays open; its client only learns about it here
    if let Some(connection) = tunnel
        .connection_id()
        .and_then(|id| state.registry.connection(id))
    {
        let notice = Frame::Notice {
            message: format!(
                "tunnel {} on public port {} was revoked by an administrator",
                tunnel.tunnel_id, tunnel.public_port
            ),
        };
        if let Err(e) = connection.try_send(notice) {
            warn!("Failed to notify {} of revocation: {}", connection.id(), e);
        }
    }

    Ok(Json(RevokeResponse {
        status: "revoked".to_string(),
        tunnel_id,
    }))
}

async fn status(State(state): State<Arc<AdminState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        active_connections: state.registry.connection_count(),
        tunnels: state.registry.list(),
    })
}

/// Serves the admin router
pub struct AdminServer {
    addr: SocketAddr,
    state: Arc<AdminState>,
}

impl AdminServer {
    pub fn new(addr: SocketAddr, state: Arc<AdminState>) -> Self {
        Self { addr, state }
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("Admin API listening on {}", listener.local_addr()?);
        axum::serve(listener, router(self.state)).await?;
        Ok(())
    }
}
