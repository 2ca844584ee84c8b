//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the router.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Root configuration for the router.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Worker pool and proxying behaviour.
    pub server: ServerConfig,

    /// Listener configuration (port, addresses).
    pub listener: ListenerConfig,

    /// Control bus connection.
    pub bus: BusConfig,

    /// Active health check settings.
    pub health_check: HealthCheckConfig,

    /// Stats aggregation settings.
    pub stats: StatsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl ProxyConfig {
    /// Whether workers run the active health checker. Its results only
    /// matter when demotion is enabled, so a zero TTL turns it off.
    pub fn active_health_checks(&self) -> bool {
        self.health_check.enabled && self.server.dead_backend_ttl_secs > 0
    }
}

/// Worker pool and request handling settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Number of worker processes spawned by the supervisor.
    pub workers: usize,

    /// Maximum concurrent backend sockets per worker.
    pub max_sockets: usize,

    /// Client socket idle timeout in seconds.
    pub tcp_timeout_secs: u64,

    /// Backend connect/response timeout in seconds.
    pub backend_timeout_secs: u64,

    /// Number of retries after a transport failure (0 disables retries).
    pub retry_on_error: u32,

    /// Treat a plain 500 from a backend as a dead-backend signal.
    pub dead_backend_on_500: bool,

    /// How long a demoted backend stays out of rotation (0 = never demote).
    pub dead_backend_ttl_secs: u64,

    /// Keep backend connections alive between requests.
    pub http_keep_alive: bool,

    /// Largest request body buffered for replay on retry.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_sockets: 200,
            tcp_timeout_secs: 30,
            backend_timeout_secs: 30,
            retry_on_error: 2,
            dead_backend_on_500: true,
            dead_backend_ttl_secs: 30,
            http_keep_alive: false,
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_timeout_secs)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }

    pub fn dead_backend_ttl(&self) -> Duration {
        Duration::from_secs(self.dead_backend_ttl_secs)
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Port shared by every listening address.
    pub port: u16,

    /// Addresses to listen on (e.g., "0.0.0.0", "::1").
    pub addresses: Vec<String>,

    /// Accept backlog passed to listen(2).
    pub backlog: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            port: 1080,
            addresses: vec!["0.0.0.0".to_string()],
            backlog: 1024,
        }
    }
}

impl ListenerConfig {
    /// Resolve the configured addresses into socket addresses.
    pub fn socket_addrs(&self) -> Result<Vec<SocketAddr>, std::net::AddrParseError> {
        self.addresses
            .iter()
            .map(|a| a.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, self.port)))
            .collect()
    }
}

/// Control bus connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// Connect to the NATS control bus at startup.
    pub enabled: bool,

    /// NATS server address (e.g., "127.0.0.1:4222").
    pub address: String,

    /// Subject prefix for router topics.
    pub subject_prefix: String,

    /// Base delay for reconnect backoff in milliseconds.
    pub reconnect_base_delay_ms: u64,

    /// Maximum delay for reconnect backoff in milliseconds.
    pub reconnect_max_delay_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "127.0.0.1:4222".to_string(),
            subject_prefix: "router".to_string(),
            reconnect_base_delay_ms: 100,
            reconnect_max_delay_ms: 5000,
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Health check interval in seconds.
    pub interval_secs: u64,

    /// Health check timeout in seconds.
    pub timeout_secs: u64,

    /// Path requested by HTTP health checks.
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 10,
            timeout_secs: 5,
            path: "/health".to_string(),
        }
    }
}

/// Stats aggregation configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Interval between worker stats snapshots in milliseconds.
    pub interval_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint on the supervisor.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
