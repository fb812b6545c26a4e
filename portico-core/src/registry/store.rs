use super::tunnel::{Owner, Tunnel};
use super::{validate_port, RegistrationError};
use crate::tunnel::session::ControlConnection;
use chrono::Utc;
use portico_protocol::{normalize_domain, Frame};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A resolved public identifier: the tunnel plus, for client owned tunnels,
/// the connection that carries its traffic
#[derive(Debug, Clone)]
pub struct Route {
    pub tunnel: Tunnel,
    pub connection: Option<Arc<ControlConnection>>,
}

/// Outcome of a fan-out to every live connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Connection ids whose queue refused the frame
    pub failed: Vec<String>,
}

#[derive(Debug)]
struct TunnelEntry {
    tunnel: Tunnel,
    seq: u64,
}

#[derive(Debug)]
struct ConnectionEntry {
    connection: Arc<ControlConnection>,
    tunnels: Vec<Uuid>,
}

#[derive(Debug, Default)]
struct Inner {
    tunnels: HashMap<Uuid, TunnelEntry>,
    by_port: HashMap<u16, Uuid>,
    by_domain: HashMap<String, Uuid>,
    connections: HashMap<String, ConnectionEntry>,
    next_seq: u64,
}

impl Inner {
    /// Claim port and domain and insert, or change nothing
    fn insert(
        &mut self,
        owner: Owner,
        local_port: u16,
        public_port: u16,
        custom_domain: Option<String>,
    ) -> Result<Tunnel, RegistrationError> {
        if self.by_port.contains_key(&public_port) {
            return Err(RegistrationError::PortInUse(public_port));
        }
        if let Some(domain) = &custom_domain {
            if self.by_domain.contains_key(domain) {
                return Err(RegistrationError::DomainInUse(domain.clone()));
            }
        }

        let tunnel = Tunnel {
            tunnel_id: Uuid::new_v4(),
            local_port,
            public_port,
            custom_domain,
            created_at: Utc::now(),
            owner,
        };

        self.by_port.insert(public_port, tunnel.tunnel_id);
        if let Some(domain) = &tunnel.custom_domain {
            self.by_domain.insert(domain.clone(), tunnel.tunnel_id);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tunnels.insert(
            tunnel.tunnel_id,
            TunnelEntry {
                tunnel: tunnel.clone(),
                seq,
            },
        );
        Ok(tunnel)
    }

    /// Drop a tunnel and release its claims
    fn remove_tunnel(&mut self, tunnel_id: &Uuid) -> Option<Tunnel> {
        let entry = self.tunnels.remove(tunnel_id)?;
        self.by_port.remove(&entry.tunnel.public_port);
        if let Some(domain) = &entry.tunnel.custom_domain {
            self.by_domain.remove(domain);
        }
        Some(entry.tunnel)
    }

    fn route(&self, tunnel_id: &Uuid) -> Option<Route> {
        let tunnel = self.tunnels.get(tunnel_id)?.tunnel.clone();
        let connection = match &tunnel.owner {
            Owner::Connection(id) => Some(Arc::clone(&self.connections.get(id)?.connection)),
            Owner::Static => None,
        };
        Some(Route { tunnel, connection })
    }
}

/// Thread-safe tunnel registry.
///
/// A single lock guards claims, tunnels and connections together, so every
/// mutation is one critical section and readers never see half a tunnel.
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    inner: RwLock<Inner>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make a freshly handshaken connection known to the registry
    pub fn attach(&self, connection: Arc<ControlConnection>) -> Result<(), RegistrationError> {
        let mut inner = self.write();
        let id = connection.id().to_string();
        if inner.connections.contains_key(&id) {
            return Err(RegistrationError::ConnectionIdTaken(id));
        }
        inner.connections.insert(
            id,
            ConnectionEntry {
                connection,
                tunnels: Vec::new(),
            },
        );
        Ok(())
    }

    /// Register a tunnel owned by a live control connection
    pub fn register(
        &self,
        connection_id: &str,
        local_port: u32,
        public_port: u32,
        custom_domain: Option<&str>,
    ) -> Result<Tunnel, RegistrationError> {
        let local_port = validate_port(local_port)?;
        let public_port = validate_port(public_port)?;
        let custom_domain = custom_domain.and_then(normalize_domain);

        let mut inner = self.write();
        match inner.connections.get(connection_id) {
            None => {
                return Err(RegistrationError::ConnectionNotFound(
                    connection_id.to_string(),
                ))
            }
            Some(entry) if !entry.tunnels.is_empty() => {
                return Err(RegistrationError::AlreadyRegistered(
                    connection_id.to_string(),
                ))
            }
            Some(_) => {}
        }

        let tunnel = inner.insert(
            Owner::Connection(connection_id.to_string()),
            local_port,
            public_port,
            custom_domain,
        )?;
        if let Some(entry) = inner.connections.get_mut(connection_id) {
            entry.tunnels.push(tunnel.tunnel_id);
        }
        drop(inner);

        info!(
            "Registered tunnel {} on public port {} for connection {}",
            tunnel.tunnel_id, tunnel.public_port, connection_id
        );
        Ok(tunnel)
    }

    /// Register a tunnel with no client behind it
    pub fn register_static(
        &self,
        local_port: u32,
        public_port: u32,
        custom_domain: Option<&str>,
    ) -> Result<Tunnel, RegistrationError> {
        let local_port = validate_port(local_port)?;
        let public_port = validate_port(public_port)?;
        let custom_domain = custom_domain.and_then(normalize_domain);

        let tunnel = self
            .write()
            .insert(Owner::Static, local_port, public_port, custom_domain)?;
        info!(
            "Registered static tunnel {} on public port {} -> local port {}",
            tunnel.tunnel_id, tunnel.public_port, tunnel.local_port
        );
        Ok(tunnel)
    }

    pub fn lookup_by_public_port(&self, port: u16) -> Result<Tunnel, RegistrationError> {
        let inner = self.read();
        inner
            .by_port
            .get(&port)
            .and_then(|id| inner.tunnels.get(id))
            .map(|entry| entry.tunnel.clone())
            .ok_or_else(|| RegistrationError::NotFound(format!("no tunnel for public port {port}")))
    }

    pub fn lookup_by_domain(&self, domain: &str) -> Result<Tunnel, RegistrationError> {
        let normalized = normalize_domain(domain)
            .ok_or_else(|| RegistrationError::NotFound("empty domain".to_string()))?;
        let inner = self.read();
        inner
            .by_domain
            .get(&normalized)
            .and_then(|id| inner.tunnels.get(id))
            .map(|entry| entry.tunnel.clone())
            .ok_or_else(|| RegistrationError::NotFound(format!("no tunnel for domain {normalized}")))
    }

    /// Resolve a public port to a tunnel and its carrying connection
    pub fn route_by_public_port(&self, port: u16) -> Result<Route, RegistrationError> {
        let inner = self.read();
        inner
            .by_port
            .get(&port)
            .and_then(|id| inner.route(id))
            .ok_or_else(|| RegistrationError::NotFound(format!("no tunnel for public port {port}")))
    }

    /// Resolve a custom domain to a tunnel and its carrying connection
    pub fn route_by_domain(&self, domain: &str) -> Option<Route> {
        let normalized = normalize_domain(domain)?;
        let inner = self.read();
        inner
            .by_domain
            .get(&normalized)
            .and_then(|id| inner.route(id))
    }

    /// Remove a connection and every tunnel it owns. Idempotent.
    pub fn deregister(&self, connection_id: &str) -> Option<Arc<ControlConnection>> {
        let mut inner = self.write();
        let entry = inner.connections.remove(connection_id)?;
        for tunnel_id in &entry.tunnels {
            inner.remove_tunnel(tunnel_id);
        }
        drop(inner);

        if entry.tunnels.is_empty() {
            debug!("Deregistered connection {} (no tunnels)", connection_id);
        } else {
            info!(
                "Deregistered connection {} and {} tunnel(s)",
                connection_id,
                entry.tunnels.len()
            );
        }
        Some(entry.connection)
    }

    /// Remove one tunnel by id, leaving its connection (if any) open
    pub fn revoke(&self, tunnel_id: Uuid) -> Result<Tunnel, RegistrationError> {
        let mut inner = self.write();
        let tunnel = inner
            .remove_tunnel(&tunnel_id)
            .ok_or_else(|| RegistrationError::tunnel_not_found(tunnel_id))?;
        if let Owner::Connection(id) = &tunnel.owner {
            if let Some(entry) = inner.connections.get_mut(id) {
                entry.tunnels.retain(|t| *t != tunnel_id);
            }
        }
        drop(inner);

        info!("Revoked tunnel {} (public port {})", tunnel_id, tunnel.public_port);
        Ok(tunnel)
    }

    /// Snapshot of every tunnel, oldest first
    pub fn list(&self) -> Vec<Tunnel> {
        let inner = self.read();
        let mut entries: Vec<&TunnelEntry> = inner.tunnels.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.tunnel.clone()).collect()
    }

    pub fn connection(&self, connection_id: &str) -> Option<Arc<ControlConnection>> {
        self.read()
            .connections
            .get(connection_id)
            .map(|entry| Arc::clone(&entry.connection))
    }

    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }

    pub fn tunnel_count(&self) -> usize {
        self.read().tunnels.len()
    }

    /// Best-effort delivery of `frame` to every live connection.
    ///
    /// A full or closed queue is recorded in the report and never stops
    /// delivery to the remaining connections.
    pub fn broadcast(&self, frame: &Frame) -> BroadcastReport {
        let connections: Vec<Arc<ControlConnection>> = self
            .read()
            .connections
            .values()
            .map(|entry| Arc::clone(&entry.connection))
            .collect();

        let mut report = BroadcastReport::default();
        for connection in connections {
            match connection.try_send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Broadcast to {} failed: {}", connection.id(), e);
                    report.failed.push(connection.id().to_string());
                }
            }
        }
        report
    }
}
