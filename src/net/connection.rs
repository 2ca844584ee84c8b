//! Connection lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count bytes read and written on the client socket
//! - Detect idle connections
//! - Expose connection state (Active → TimedOut/Closed) to in-flight requests

use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state for lifecycle tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    /// Idle timeout fired; the socket is being destroyed.
    TimedOut,
    Closed,
}

/// Socket counters in the shape written to the operational log.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketInfo {
    pub remote_address: Option<String>,
    pub remote_port: Option<u16>,
    pub bytes_written: u64,
    pub bytes_read: u64,
    /// Seconds since the connection was accepted.
    pub elapsed: f64,
}

impl std::fmt::Display for SocketInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

#[derive(Debug)]
struct Shared {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    opened: Instant,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    /// Milliseconds since `opened` of the last read or write.
    last_activity: AtomicU64,
    state: watch::Sender<ConnectionState>,
}

/// Shared view of one client connection, handed to every request on it.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn new(peer: Option<SocketAddr>, local: Option<SocketAddr>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Active);
        Self {
            shared: Arc::new(Shared {
                id: ConnectionId::new(),
                peer,
                local,
                opened: Instant::now(),
                bytes_read: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
                last_activity: AtomicU64::new(0),
                state,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local
    }

    pub fn bytes_read(&self) -> u64 {
        self.shared.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.shared.bytes_written.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        let now = self.shared.opened.elapsed().as_millis() as u64;
        self.shared.last_activity.store(now, Ordering::Relaxed);
    }

    /// Time since the last byte moved in either direction.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.shared.last_activity.load(Ordering::Relaxed));
        self.shared.opened.elapsed().saturating_sub(last)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Flag the connection as timed out. In-flight requests treat this as a transport error.
    pub fn mark_timed_out(&self) {
        self.shared.state.send_replace(ConnectionState::TimedOut);
    }

    pub fn mark_closed(&self) {
        self.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Active {
                *state = ConnectionState::Closed;
                true
            } else {
                false
            }
        });
    }

    pub fn is_closed(&self) -> bool {
        self.state() != ConnectionState::Active
    }

    pub fn timed_out(&self) -> bool {
        self.state() == ConnectionState::TimedOut
    }

    /// Resolve once the connection leaves the Active state.
    pub async fn closed(&self) -> ConnectionState {
        let mut rx = self.shared.state.subscribe();
        let state = match rx.wait_for(|s| *s != ConnectionState::Active).await {
            Ok(state) => *state,
            Err(_) => ConnectionState::Closed,
        };
        state
    }

    pub fn socket_info(&self) -> SocketInfo {
        SocketInfo {
            remote_address: self.shared.peer.map(|a| a.ip().to_string()),
            remote_port: self.shared.peer.map(|a| a.port()),
            bytes_written: self.bytes_written(),
            bytes_read: self.bytes_read(),
            elapsed: self.shared.opened.elapsed().as_secs_f64(),
        }
    }
}

/// Resolve once the connection has been idle for `timeout`.
pub async fn idle_timeout(handle: &ConnectionHandle, timeout: Duration) {
    loop {
        let idle = handle.idle_for();
        if idle >= timeout {
            return;
        }
        tokio::time::sleep(timeout - idle).await;
    }
}

/// Stream wrapper that feeds a `ConnectionHandle`'s counters.
#[derive(Debug)]
pub struct MeteredStream<S> {
    inner: S,
    handle: ConnectionHandle,
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S, handle: ConnectionHandle) -> Self {
        Self { inner, handle }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let n = (buf.filled().len() - before) as u64;
            if n > 0 {
                self.handle.shared.bytes_read.fetch_add(n, Ordering::Relaxed);
                self.handle.touch();
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            if n > 0 {
                self.handle.shared.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
                self.handle.touch();
            }
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[tokio::test]
    async fn metered_stream_counts_bytes() {
        let handle = ConnectionHandle::new(None, None);
        let (client, server) = tokio::io::duplex(64);
        let mut metered = MeteredStream::new(server, handle.clone());
        let mut client = client;

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        metered.read_exact(&mut buf).await.unwrap();
        metered.write_all(b"hi").await.unwrap();

        assert_eq!(handle.bytes_read(), 5);
        assert_eq!(handle.bytes_written(), 2);
    }

    #[tokio::test]
    async fn state_transitions_wake_waiters() {
        let handle = ConnectionHandle::new(None, None);
        assert!(!handle.is_closed());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.closed().await })
        };
        handle.mark_timed_out();
        assert_eq!(waiter.await.unwrap(), ConnectionState::TimedOut);

        // closing after a timeout keeps the timeout visible
        handle.mark_closed();
        assert!(handle.timed_out());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_fires_without_traffic() {
        let handle = ConnectionHandle::new(None, None);
        let started = tokio::time::Instant::now();
        idle_timeout(&handle, Duration::from_secs(5)).await;
        assert!(started.elapsed() >= Duration::from_secs(5));
    }
}
