//! TCP listener implementation with a global connection cap.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Accept incoming TCP connections
//! - Enforce max_connections limit via semaphore
//!
//! # Design Decisions
//! - At capacity the socket is handed back unadmitted so the caller can log
//!   and drop it before any rule evaluation

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::schema::ListenerConfig;
use crate::config::ConfigError;
use crate::error::{GatekeeperError, Result};

/// Outcome of one accept.
#[derive(Debug)]
pub enum Accepted {
    Admitted {
        stream: TcpStream,
        peer: SocketAddr,
        permit: ConnectionPermit,
    },
    /// No slot was free; dropping `stream` closes it.
    AtCapacity { stream: TcpStream, peer: SocketAddr },
}

/// A bounded TCP listener that limits concurrent connections.
pub struct Listener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    /// Bind to the configured address with connection limits.
    pub async fn bind(config: &ListenerConfig) -> Result<Self> {
        let addr: SocketAddr =
            config
                .bind_address()
                .parse()
                .map_err(|e| ConfigError::Invalid {
                    var: "FIREWALL_HOST",
                    reason: format!("{}: {}", config.bind_address(), e),
                })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatekeeperError::Bind { addr, source })?;
        Self::from_listener(listener, config.max_connections)
    }

    /// Wrap an already bound listener.
    pub fn from_listener(listener: TcpListener, max_connections: usize) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        tracing::info!(
            address = %local_addr,
            max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    /// Accept the next connection and try to reserve a slot for it.
    pub async fn accept(&self) -> std::io::Result<Accepted> {
        let (stream, peer) = self.inner.accept().await?;

        match Arc::clone(&self.connection_limit).try_acquire_owned() {
            Ok(permit) => {
                tracing::debug!(
                    peer_addr = %peer,
                    available_permits = self.connection_limit.available_permits(),
                    "Connection accepted"
                );
                Ok(Accepted::Admitted {
                    stream,
                    peer,
                    permit: ConnectionPermit { _permit: permit },
                })
            }
            Err(_) => Ok(Accepted::AtCapacity { stream, peer }),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A connection slot. Dropping it releases the slot, even if the handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}
