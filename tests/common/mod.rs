//! Shared utilities for integration tests.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use route_machine::config::ProxyConfig;
use route_machine::http::{HttpServer, HyperForwarder, Pipeline};
use route_machine::net::Listener;
use route_machine::observability::TracingAccessLog;
use route_machine::registry::{BackendDescriptor, BackendRegistry};
use route_machine::Shutdown;

/// Canned backend reply.
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: String,
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
        }
    }
}

async fn read_head(socket: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Start a backend that answers every request with `f(request_head)`.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Reply> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let f = f.clone();
            tokio::spawn(async move {
                let head = read_head(&mut socket).await;
                let reply = f(head).await;
                let mut response = format!(
                    "HTTP/1.1 {} X\r\nContent-Length: {}\r\nConnection: close\r\n",
                    reply.status,
                    reply.body.len()
                );
                for (name, value) in &reply.headers {
                    response.push_str(&format!("{name}: {value}\r\n"));
                }
                response.push_str("\r\n");
                response.push_str(&reply.body);
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// Start a backend that reads each request head and hangs up without answering.
/// Returns the number of requests it has seen.
pub async fn start_closing_backend() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                read_head(&mut socket).await;
                counter.fetch_add(1, Ordering::SeqCst);
                drop(socket);
            });
        }
    });
    (addr, hits)
}

/// Start a backend that always returns `body`.
pub async fn start_mock_backend(body: &'static str) -> SocketAddr {
    start_programmable_backend(move |_| async move { Reply::ok(body) }).await
}

/// Start a WebSocket backend that echoes every message.
pub async fn start_ws_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    if message.is_close() {
                        break;
                    }
                    if ws.send(message).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// A port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn descriptor(addr: SocketAddr) -> BackendDescriptor {
    BackendDescriptor {
        hostname: addr.ip().to_string(),
        port: addr.port(),
        instance_id: format!("i-{}", addr.port()),
        ..Default::default()
    }
}

pub struct TestProxy {
    pub addr: SocketAddr,
    pub registry: Arc<BackendRegistry>,
    pub shutdown: Shutdown,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Run a single worker's HTTP server on an ephemeral port.
pub async fn start_proxy(config: ProxyConfig) -> TestProxy {
    let registry = Arc::new(BackendRegistry::new(config.server.dead_backend_ttl()));
    start_proxy_with(config, registry).await
}

pub async fn start_proxy_with(config: ProxyConfig, registry: Arc<BackendRegistry>) -> TestProxy {
    let listener = Listener::from_tokio(TcpListener::bind("127.0.0.1:0").await.unwrap()).unwrap();
    let addr = listener.local_addr();

    let pipeline = Arc::new(Pipeline::new(
        &config,
        registry.clone(),
        Arc::new(HyperForwarder::new(&config.server)),
        Arc::new(TracingAccessLog),
    ));
    let shutdown = Shutdown::new();
    tokio::spawn(HttpServer::new(pipeline).run(vec![listener], shutdown.clone()));

    TestProxy {
        addr,
        registry,
        shutdown,
    }
}

/// HTTP client that never reuses connections.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .build()
        .unwrap()
}
