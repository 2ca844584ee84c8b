//! HTTP server setup.
//!
//! # Responsibilities
//! - Create the Axum Router with the proxy handler
//! - Run one accept loop per listener
//! - Serve each connection with HTTP/1.1, keep-alive off, upgrades on
//! - Enforce the client idle timeout

use axum::{
    body::Body,
    extract::State,
    http::{Request, Response, StatusCode},
    Extension, Router,
};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::http::headers::is_websocket_upgrade;
use crate::http::pipeline::Pipeline;
use crate::http::response::{error_page, DropConnection};
use crate::lifecycle::Shutdown;
use crate::net::{idle_timeout, ConnectionHandle, Listener, MeteredStream};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

/// HTTP front end of a worker.
pub struct HttpServer {
    router: Router,
    tcp_timeout: Duration,
}

impl HttpServer {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let tcp_timeout = pipeline.tcp_timeout;
        let router = Self::build_router(AppState { pipeline });
        Self {
            router,
            tcp_timeout,
        }
    }

    /// Every path and method on every host goes to the proxy handler.
    fn build_router(state: AppState) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Accept on every listener until `shutdown` fires.
    pub async fn run(self, listeners: Vec<Listener>, shutdown: Shutdown) {
        let mut loops = JoinSet::new();
        for listener in listeners {
            tracing::info!(address = %listener.local_addr(), "HTTP server starting");
            loops.spawn(accept_loop(
                listener,
                self.router.clone(),
                self.tcp_timeout,
                shutdown.subscribe(),
            ));
        }
        while loops.join_next().await.is_some() {}
        tracing::info!("HTTP server stopped");
    }
}

async fn accept_loop(
    listener: Listener,
    router: Router,
    tcp_timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let local = listener.local_addr();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_connection(stream, peer, local, router.clone(), tcp_timeout));
                }
                Err(e) => {
                    tracing::warn!(address = %local, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            _ = shutdown.recv() => break,
        }
    }
}

/// Serve one client connection.
pub async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    router: Router,
    tcp_timeout: Duration,
) {
    let _ = stream.set_nodelay(true);
    let handle = ConnectionHandle::new(Some(peer), Some(local));
    let io = TokioIo::new(MeteredStream::new(stream, handle.clone()));

    let request_handle = handle.clone();
    let service = tower::service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(request_handle.clone());
        let router = router.clone();
        async move {
            let response = match router.oneshot(request).await {
                Ok(response) => response,
                Err(never) => match never {},
            };
            // hyper closes the connection without writing when the service fails
            if response.extensions().get::<DropConnection>().is_some() {
                return Err(DropConnection);
            }
            Ok(response)
        }
    });

    let connection = http1::Builder::new()
        .keep_alive(false)
        .serve_connection(io, TowerToHyperService::new(service))
        .with_upgrades();

    let span = tracing::debug_span!("connection", id = %handle.id(), peer = %peer);
    async {
        tokio::select! {
            res = connection => {
                if let Err(e) = res {
                    tracing::debug!(error = %e, connection = %handle.socket_info(), "TCP error");
                }
            }
            _ = idle_timeout(&handle, tcp_timeout) => {
                handle.mark_timed_out();
                tracing::warn!(connection = %handle.socket_info(), "TCP timeout");
            }
        }
    }
    .instrument(span)
    .await;
    handle.mark_closed();
}

async fn proxy_handler(
    State(state): State<AppState>,
    Extension(conn): Extension<ConnectionHandle>,
    request: Request<Body>,
) -> Response<Body> {
    if is_websocket_upgrade(request.headers()) {
        return state.pipeline.upgrade(request, conn).await;
    }

    match tokio::spawn(state.pipeline.clone().handle(request, conn)).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "Request task failed");
            error_page(StatusCode::INTERNAL_SERVER_ERROR, "Internal error", false)
        }
    }
}
