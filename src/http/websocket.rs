//! WebSocket upgrade proxying.
//!
//! # Responsibilities
//! - Pick a backend for the upgrade request (no retry, no classification)
//! - Relay the backend's 101 response to the client
//! - Hang up on the client when no backend takes the upgrade
//! - Splice the two upgraded streams until either side closes or idles out

use axum::body::Body;
use axum::http::header;
use axum::http::{Request, Response, StatusCode, Version};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::time::Duration;

use crate::http::headers::inject_forwarded;
use crate::http::pipeline::Pipeline;
use crate::http::response::drop_connection;
use crate::net::{idle_timeout, ConnectionHandle};
use crate::registry::Selection;

impl Pipeline {
    /// Proxy a WebSocket upgrade request.
    pub async fn upgrade(&self, mut request: Request<Body>, conn: ConnectionHandle) -> Response<Body> {
        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let backend = match self.registry.select(host.as_deref()) {
            Ok(Selection::Backend { backend, .. }) => backend,
            Ok(Selection::Ping) => {
                tracing::warn!(host = ?host, "WebSocket upgrade to the ping host");
                return drop_connection();
            }
            Err(err) => {
                tracing::warn!(host = ?host, error = %err, "Cannot proxy WebSocket request");
                return drop_connection();
            }
        };

        let client_upgrade = hyper::upgrade::on(&mut request);

        let (parts, _) = request.into_parts();
        let mut outbound = Request::new(Body::empty());
        *outbound.method_mut() = parts.method;
        *outbound.uri_mut() = parts.uri;
        *outbound.version_mut() = Version::HTTP_11;
        *outbound.headers_mut() = parts.headers;
        if let Some(remote) = conn.peer_addr() {
            inject_forwarded(
                outbound.headers_mut(),
                remote.ip(),
                conn.local_addr().map(|addr| addr.port()),
            );
        }

        let mut response = match self.forwarder.forward(&backend, outbound).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    vhost = %backend.virtual_host(),
                    backend = %backend.authority(),
                    code = err.code(),
                    error = %err,
                    "WebSocket backend error"
                );
                return drop_connection();
            }
        };

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            tracing::debug!(
                vhost = %backend.virtual_host(),
                status = %response.status(),
                "Backend refused WebSocket upgrade"
            );
            return response;
        }

        let backend_upgrade = hyper::upgrade::on(&mut response);
        tokio::spawn(splice(client_upgrade, backend_upgrade, conn, self.tcp_timeout));
        response
    }
}

async fn splice(client: OnUpgrade, backend: OnUpgrade, conn: ConnectionHandle, idle: Duration) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(error = %e, connection = %conn.socket_info(), "WebSocket upgrade failed");
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut backend = TokioIo::new(backend);

    tokio::select! {
        res = tokio::io::copy_bidirectional(&mut client, &mut backend) => match res {
            Ok((up, down)) => tracing::debug!(up, down, "WebSocket closed"),
            Err(e) => tracing::debug!(error = %e, connection = %conn.socket_info(), "WebSocket error"),
        },
        _ = idle_timeout(&conn, idle) => {
            conn.mark_timed_out();
            tracing::warn!(connection = %conn.socket_info(), "TCP timeout");
        }
    }
}
