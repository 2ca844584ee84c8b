//! route-machine: a dynamic HTTP/WebSocket router.
//!
//! Backends announce themselves on a control bus; every worker keeps its
//! own registry of virtual host pools and proxies inbound requests to them
//! round-robin, retrying transport failures and demoting dead backends.
//! A supervisor process keeps the workers alive and aggregates their stats.

// Routing core
pub mod bus;
pub mod registry;

// Request path
pub mod http;
pub mod net;

// Process model
pub mod cluster;

// Cross-cutting concerns
pub mod config;
pub mod health;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use registry::BackendRegistry;
