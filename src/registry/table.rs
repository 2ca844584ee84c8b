//! Virtual host → backend pool table.
//!
//! # Responsibilities
//! - Apply registration and deregistration events
//! - Resolve a `Host` header to the next backend in rotation
//! - Demote failing backends
//! - Produce per-interval stats snapshots and introspection listings

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::registry::backend::{Backend, BackendDescriptor, BackendInfo};
use crate::registry::pool::VirtualHostPool;
use crate::registry::stats::StatsSnapshot;

/// Reserved host answered directly by the router, used by load balancer health checks.
pub const PING_HOST: &str = "__ping__";

/// Why a `Host` header could not be resolved to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no host header")]
    MissingHost,

    #[error("frontend not found")]
    UnknownVirtualHost,

    #[error("Cannot find a valid backend")]
    NoHealthyBackend,
}

/// Successful outcome of `select`.
#[derive(Debug, Clone)]
pub enum Selection {
    /// The reserved health-check host.
    Ping,
    Backend {
        backend: Arc<Backend>,
        /// Normalized key the request matched.
        frontend: String,
    },
}

/// Registry mutation delivered by the control bus.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Register(BackendDescriptor),
    Unregister(BackendDescriptor),
}

/// Result of asking the registry to demote a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemotionOutcome {
    Demoted,
    AlreadyDemoted,
    /// The backend is the only member of its pool and stays in rotation.
    SoleMember,
    /// Demotion is switched off (TTL of zero).
    Disabled,
}

/// Lower-case a `Host` value and strip any port suffix.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let bare = if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        match host.find(':') {
            Some(idx) if idx > 0 => &host[..idx],
            _ => host,
        }
    };
    bare.to_ascii_lowercase()
}

/// Per-worker backend registry.
#[derive(Debug)]
pub struct BackendRegistry {
    pools: DashMap<String, VirtualHostPool>,
    dead_backend_ttl: Duration,
}

impl BackendRegistry {
    /// Create an empty registry. A zero TTL turns `mark_dead` into a log-only hook.
    pub fn new(dead_backend_ttl: Duration) -> Self {
        Self {
            pools: DashMap::new(),
            dead_backend_ttl,
        }
    }

    /// Add a backend to a virtual host's pool. Duplicate registrations are ignored.
    pub fn register(&self, virtual_host: &str, descriptor: &BackendDescriptor) {
        let key = normalize_host(virtual_host);
        let mut pool = self.pools.entry(key.clone()).or_default();
        if pool.contains(&descriptor.hostname, descriptor.port) {
            return;
        }

        let backend = Arc::new(Backend::new(key.clone(), descriptor.clone()));
        pool.push(backend);
        tracing::debug!(
            vhost = %key,
            backend = %format!("{}:{}", descriptor.hostname, descriptor.port),
            instance_id = %descriptor.instance_id,
            pool_size = pool.len(),
            "Backend registered"
        );
    }

    /// Remove a backend from a virtual host's pool.
    ///
    /// The pool itself is kept, so an emptied pool reports `NoHealthyBackend`
    /// rather than `UnknownVirtualHost`.
    pub fn unregister(&self, virtual_host: &str, descriptor: &BackendDescriptor) {
        let key = normalize_host(virtual_host);
        let mut pool = self.pools.entry(key.clone()).or_default();
        if pool.remove(&descriptor.hostname, descriptor.port).is_some() {
            tracing::debug!(
                vhost = %key,
                backend = %format!("{}:{}", descriptor.hostname, descriptor.port),
                pool_size = pool.len(),
                "Backend unregistered"
            );
        }
    }

    /// Apply a control bus event to every virtual host listed in its descriptor.
    pub fn apply(&self, event: &RegistryEvent) {
        match event {
            RegistryEvent::Register(d) => {
                for vhost in &d.uris {
                    self.register(vhost, d);
                }
            }
            RegistryEvent::Unregister(d) => {
                for vhost in &d.uris {
                    self.unregister(vhost, d);
                }
            }
        }
    }

    /// Resolve a `Host` header to the next backend in rotation.
    pub fn select(&self, host_header: Option<&str>) -> Result<Selection, RouteError> {
        let host = host_header.ok_or(RouteError::MissingHost)?;
        if host == PING_HOST {
            return Ok(Selection::Ping);
        }

        let key = normalize_host(host);
        let mut pool = self
            .pools
            .get_mut(&key)
            .ok_or(RouteError::UnknownVirtualHost)?;
        let backend = pool.rotate().ok_or(RouteError::NoHealthyBackend)?;

        Ok(Selection::Backend {
            backend,
            frontend: key,
        })
    }

    /// Number of backends registered for a virtual host (0 if absent).
    pub fn pool_len(&self, virtual_host: &str) -> usize {
        self.pools
            .get(&normalize_host(virtual_host))
            .map(|p| p.len())
            .unwrap_or(0)
    }

    /// Take a failing backend out of rotation for the configured TTL.
    pub fn mark_dead(&self, backend: &Backend) -> DemotionOutcome {
        if self.dead_backend_ttl.is_zero() {
            return DemotionOutcome::Disabled;
        }
        if self.pool_len(backend.virtual_host()) <= 1 {
            return DemotionOutcome::SoleMember;
        }
        if backend.demote(self.dead_backend_ttl) {
            DemotionOutcome::Demoted
        } else {
            DemotionOutcome::AlreadyDemoted
        }
    }

    /// Sum and reset every non-empty pool's counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut snapshot = StatsSnapshot::default();
        for entry in self.pools.iter() {
            if let Some(stats) = entry.value().drain_stats() {
                snapshot.hosts.insert(entry.key().clone(), stats);
            }
        }
        snapshot
    }

    /// Every virtual host and the backends registered for it.
    pub fn list_all(&self) -> BTreeMap<String, Vec<BackendInfo>> {
        self.pools
            .iter()
            .map(|entry| {
                let infos = entry.value().iter().map(|b| b.info()).collect();
                (entry.key().clone(), infos)
            })
            .collect()
    }

    /// Every registered backend, for active health checking.
    pub fn all_backends(&self) -> Vec<Arc<Backend>> {
        self.pools
            .iter()
            .flat_map(|entry| entry.value().iter().cloned().collect::<Vec<_>>())
            .collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(hostname: &str, port: u16) -> BackendDescriptor {
        BackendDescriptor {
            hostname: hostname.into(),
            port,
            instance_id: format!("{}-{}", hostname, port),
            ..Default::default()
        }
    }

    fn selected(registry: &BackendRegistry, host: &str) -> Arc<Backend> {
        match registry.select(Some(host)).unwrap() {
            Selection::Backend { backend, .. } => backend,
            Selection::Ping => panic!("unexpected ping selection"),
        }
    }

    #[test]
    fn round_robin_visits_each_backend_once_in_order() {
        let registry = BackendRegistry::default();
        for port in [8080, 8081, 8082] {
            registry.register("app.example.com", &descriptor("10.0.0.1", port));
        }

        let ports: Vec<u16> = (0..4)
            .map(|_| selected(&registry, "app.example.com").port())
            .collect();
        assert_eq!(ports, vec![8080, 8081, 8082, 8080]);
    }

    #[test]
    fn duplicate_registration_is_ignored() {
        let registry = BackendRegistry::default();
        registry.register("app.example.com", &descriptor("10.0.0.1", 8080));
        registry.register("APP.example.com", &descriptor("10.0.0.1", 8080));
        assert_eq!(registry.pool_len("app.example.com"), 1);
    }

    #[test]
    fn unregister_last_backend_leaves_empty_pool() {
        let registry = BackendRegistry::default();
        let d = descriptor("10.0.0.1", 8080);
        registry.register("app.example.com", &d);
        registry.unregister("app.example.com", &d);

        assert_eq!(
            registry.select(Some("app.example.com")).unwrap_err(),
            RouteError::NoHealthyBackend
        );
    }

    #[test]
    fn unknown_and_missing_hosts() {
        let registry = BackendRegistry::default();
        assert_eq!(
            registry.select(Some("nosuchhost")).unwrap_err(),
            RouteError::UnknownVirtualHost
        );
        assert_eq!(registry.select(None).unwrap_err(), RouteError::MissingHost);
        assert!(matches!(registry.select(Some(PING_HOST)), Ok(Selection::Ping)));
    }

    #[test]
    fn host_header_is_normalized() {
        let registry = BackendRegistry::default();
        registry.register("app.example.com", &descriptor("10.0.0.1", 8080));

        match registry.select(Some("App.Example.COM:8000")).unwrap() {
            Selection::Backend { frontend, backend } => {
                assert_eq!(frontend, "app.example.com");
                assert_eq!(backend.port(), 8080);
            }
            Selection::Ping => panic!("unexpected ping selection"),
        }
        assert_eq!(normalize_host("[::1]:8080"), "[::1]");
    }

    #[test]
    fn apply_fans_out_over_uris() {
        let registry = BackendRegistry::default();
        let mut d = descriptor("10.0.0.1", 8080);
        d.uris = vec!["a.example.com".into(), "b.example.com".into()];

        registry.apply(&RegistryEvent::Register(d.clone()));
        assert_eq!(registry.pool_len("a.example.com"), 1);
        assert_eq!(registry.pool_len("b.example.com"), 1);

        registry.apply(&RegistryEvent::Unregister(d));
        assert_eq!(registry.pool_len("a.example.com"), 0);
        assert_eq!(registry.list_all().len(), 2);
    }

    #[test]
    fn mark_dead_spares_sole_member() {
        let registry = BackendRegistry::new(Duration::from_secs(30));
        registry.register("app.example.com", &descriptor("10.0.0.1", 8080));
        let only = selected(&registry, "app.example.com");
        assert_eq!(registry.mark_dead(&only), DemotionOutcome::SoleMember);

        registry.register("app.example.com", &descriptor("10.0.0.2", 8080));
        assert_eq!(registry.mark_dead(&only), DemotionOutcome::Demoted);
        assert_eq!(registry.mark_dead(&only), DemotionOutcome::AlreadyDemoted);

        // demoted backend is skipped by rotation
        for _ in 0..3 {
            assert_eq!(selected(&registry, "app.example.com").hostname(), "10.0.0.2");
        }
    }

    #[test]
    fn zero_ttl_disables_demotion() {
        let registry = BackendRegistry::default();
        registry.register("app.example.com", &descriptor("10.0.0.1", 8080));
        registry.register("app.example.com", &descriptor("10.0.0.2", 8080));
        let b = selected(&registry, "app.example.com");
        assert_eq!(registry.mark_dead(&b), DemotionOutcome::Disabled);
        assert!(!b.is_demoted());
    }

    #[test]
    fn snapshot_skips_empty_pools_and_resets() {
        let registry = BackendRegistry::default();
        let mut d = descriptor("10.0.0.1", 8080);
        d.metrics_session = Some("tok".into());
        registry.register("app.example.com", &d);
        registry.register("empty.example.com", &d);
        registry.unregister("empty.example.com", &d);

        selected(&registry, "app.example.com").record(64, 32, Duration::from_millis(12));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.hosts.len(), 1);
        let stats = &snapshot.hosts["app.example.com"];
        assert_eq!(stats.count, 1);
        assert_eq!(stats.bytes_written, 64);
        assert_eq!(stats.metrics_session.as_deref(), Some("tok"));

        assert_eq!(registry.snapshot().hosts["app.example.com"].count, 0);
    }
}
