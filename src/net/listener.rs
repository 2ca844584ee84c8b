//! TCP listener shared across worker processes.
//!
//! # Responsibilities
//! - Bind every configured address on the shared port
//! - Set SO_REUSEPORT so all workers can bind the same port
//! - Accept incoming TCP connections

use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::config::ListenerConfig;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Invalid listen address: {0}")]
    Address(#[from] std::net::AddrParseError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to accept: {0}")]
    Accept(#[source] std::io::Error),
}

/// A listening socket for inbound client connections.
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind to `addr` with SO_REUSEADDR and SO_REUSEPORT set.
    pub fn bind(addr: SocketAddr, backlog: u32) -> Result<Self, ListenerError> {
        let bind_err = |source| ListenerError::Bind { addr, source };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;

        socket.set_reuseaddr(true).map_err(bind_err)?;
        #[cfg(unix)]
        socket.set_reuseport(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;

        let inner = socket.listen(backlog).map_err(bind_err)?;
        Self::from_tokio(inner)
    }

    /// Wrap an already bound listener.
    pub fn from_tokio(inner: TcpListener) -> Result<Self, ListenerError> {
        let local_addr = inner.local_addr().map_err(ListenerError::Accept)?;
        tracing::info!(address = %local_addr, "Listener bound");
        Ok(Self { inner, local_addr })
    }

    /// Accept a new connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ListenerError> {
        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        tracing::trace!(peer_addr = %addr, "Connection accepted");
        Ok((stream, addr))
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Bind one listener per configured address.
pub fn bind_all(config: &ListenerConfig) -> Result<Vec<Listener>, ListenerError> {
    config
        .socket_addrs()?
        .into_iter()
        .map(|addr| Listener::bind(addr, config.backlog))
        .collect()
}
