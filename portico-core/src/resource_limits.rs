//! Connection cap for the control listener

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Resource limit errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResourceLimitError {
    #[error("maximum control connections reached ({max})")]
    MaxConnectionsReached { max: usize },
}

/// Global server resource limits
#[derive(Debug, Clone)]
pub struct ServerResourceLimits {
    connection_semaphore: Arc<Semaphore>,
    max_connections: usize,
}

impl ServerResourceLimits {
    #[must_use]
    pub fn new(max_connections: usize) -> Self {
        Self {
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    /// Try to acquire a connection slot
    ///
    /// The permit must be held for the connection's lifetime.
    pub fn try_acquire_connection(&self) -> Result<ConnectionPermit, ResourceLimitError> {
        match self.connection_semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(ConnectionPermit { _permit: permit }),
            Err(_) => Err(ResourceLimitError::MaxConnectionsReached {
                max: self.max_connections,
            }),
        }
    }

    #[must_use]
    pub fn available_connections(&self) -> usize {
        self.connection_semaphore.available_permits()
    }

    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

impl Default for ServerResourceLimits {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Permit for holding a connection slot
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}
