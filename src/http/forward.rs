//! Forwarding engine.
//!
//! # Responsibilities
//! - Send a prepared request to one backend and hand back its response
//! - Bound concurrent backend requests per worker
//! - Classify transport failures so the pipeline can demote and retry
//!
//! The pipeline talks to a `Forwarder` so tests can script backend behaviour.

use axum::body::Body;
use axum::http::{Request, Response};
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::config::ServerConfig;
use crate::registry::Backend;

/// Why a forwarding attempt produced no response.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("connection refused")]
    Refused,

    #[error("timed out")]
    TimedOut,

    /// The client connection hit its idle timeout while waiting on the backend.
    #[error("TCP timeout")]
    ClientIdleTimeout,

    /// The client went away while waiting on the backend.
    #[error("client connection closed")]
    ClientClosed,

    #[error("connection reset")]
    Reset,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Other(String),
}

impl ForwardError {
    /// Short code for log lines.
    pub fn code(&self) -> &'static str {
        match self {
            ForwardError::Refused => "ECONNREFUSED",
            ForwardError::TimedOut => "ETIMEDOUT",
            ForwardError::ClientIdleTimeout => "TCP_TIMEOUT",
            ForwardError::ClientClosed => "ECONNABORTED",
            ForwardError::Reset => "ECONNRESET",
            ForwardError::InvalidRequest(_) => "EINVAL",
            ForwardError::Other(_) => "EPROTO",
        }
    }

    /// Whether this failure is evidence the backend is dead.
    pub fn marks_dead(&self) -> bool {
        matches!(
            self,
            ForwardError::Refused | ForwardError::TimedOut | ForwardError::ClientIdleTimeout
        )
    }

    /// Classify a client error by the first `io::Error` in its source chain.
    pub fn from_client_error(err: &hyper_util::client::legacy::Error) -> Self {
        let mut source: Option<&(dyn StdError + 'static)> = err.source();
        while let Some(cause) = source {
            if let Some(io_err) = cause.downcast_ref::<io::Error>() {
                return Self::from_io(io_err);
            }
            source = cause.source();
        }
        ForwardError::Other(err.to_string())
    }

    fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ForwardError::Refused,
            io::ErrorKind::TimedOut => ForwardError::TimedOut,
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => ForwardError::Reset,
            _ => ForwardError::Other(err.to_string()),
        }
    }
}

/// Sends one request to one backend.
pub trait Forwarder: Send + Sync {
    /// `request` carries an origin-form URI; the forwarder targets `backend`.
    fn forward(
        &self,
        backend: &Backend,
        request: Request<Body>,
    ) -> BoxFuture<'static, Result<Response<Body>, ForwardError>>;
}

/// `Forwarder` backed by the hyper-util pooled client.
#[derive(Clone)]
pub struct HyperForwarder {
    client: Client<HttpConnector, Body>,
    sockets: Arc<Semaphore>,
    timeout: Duration,
}

impl HyperForwarder {
    pub fn new(config: &ServerConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.backend_timeout()));
        connector.set_nodelay(true);

        let mut builder = Client::builder(TokioExecutor::new());
        if !config.http_keep_alive {
            builder.pool_max_idle_per_host(0);
        }

        Self {
            client: builder.build(connector),
            sockets: Arc::new(Semaphore::new(config.max_sockets)),
            timeout: config.backend_timeout(),
        }
    }
}

impl Forwarder for HyperForwarder {
    fn forward(
        &self,
        backend: &Backend,
        request: Request<Body>,
    ) -> BoxFuture<'static, Result<Response<Body>, ForwardError>> {
        let client = self.client.clone();
        let sockets = self.sockets.clone();
        let timeout = self.timeout;
        let target = backend.url();

        Box::pin(async move {
            let (mut parts, body) = request.into_parts();
            let path = parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            parts.uri = format!("{target}{path}")
                .parse()
                .map_err(|e: axum::http::uri::InvalidUri| {
                    ForwardError::InvalidRequest(e.to_string())
                })?;
            let request = Request::from_parts(parts, body);

            // Permit is held until the response body is fully consumed.
            let permit = sockets
                .acquire_owned()
                .await
                .map_err(|e| ForwardError::Other(e.to_string()))?;

            let response = match tokio::time::timeout(timeout, client.request(request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(ForwardError::from_client_error(&e)),
                Err(_) => return Err(ForwardError::TimedOut),
            };

            let (parts, body) = response.into_parts();
            let stream = Body::new(body).into_data_stream().map(move |chunk| {
                let _ = &permit;
                chunk
            });
            Ok(Response::from_parts(parts, Body::from_stream(stream)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BackendDescriptor;
    use axum::http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn backend_at(port: u16) -> Backend {
        Backend::new(
            "app.test",
            BackendDescriptor {
                hostname: "127.0.0.1".to_string(),
                port,
                ..Default::default()
            },
        )
    }

    #[test]
    fn only_connect_failures_mark_dead() {
        assert!(ForwardError::Refused.marks_dead());
        assert!(ForwardError::TimedOut.marks_dead());
        assert!(ForwardError::ClientIdleTimeout.marks_dead());
        assert!(!ForwardError::Reset.marks_dead());
        assert!(!ForwardError::Other("boom".into()).marks_dead());
    }

    #[tokio::test]
    async fn max_sockets_bounds_in_flight_backend_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let seen = accepted.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                seen.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    // Headers only; the body stays pending.
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n")
                        .await;
                    tokio::time::sleep(Duration::from_secs(30)).await;
                });
            }
        });

        let mut config = ServerConfig::default();
        config.max_sockets = 1;
        let forwarder = HyperForwarder::new(&config);
        let backend = backend_at(port);
        let request = || Request::builder().uri("/").body(Body::empty()).unwrap();

        let first = forwarder.forward(&backend, request()).await.unwrap();
        let second = tokio::spawn(forwarder.forward(&backend, request()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert!(!second.is_finished());

        // Dropping the first body releases its socket permit.
        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(5), second)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refused_connection_is_classified() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let forwarder = HyperForwarder::new(&ServerConfig::default());
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let err = forwarder
            .forward(&backend_at(port), request)
            .await
            .unwrap_err();

        assert!(matches!(err, ForwardError::Refused), "got {err:?}");
    }
}
