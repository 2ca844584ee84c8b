//! Active health checking.
//!
//! # Responsibilities
//! - Periodically check registered backends
//! - Demote backends that fail, reinstate those that answer

use axum::body::Body;
use axum::http::Request;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time;

use crate::config::HealthCheckConfig;
use crate::registry::{Backend, BackendRegistry, DemotionOutcome};

pub struct HealthMonitor {
    registry: Arc<BackendRegistry>,
    config: HealthCheckConfig,
    client: Client<HttpConnector, Body>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<BackendRegistry>, config: HealthCheckConfig) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Self {
            registry,
            config,
            client,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Active health checks disabled");
            return;
        }

        tracing::info!(
            interval = self.config.interval_secs,
            path = %self.config.path,
            "Health monitor starting"
        );

        let mut ticker = time::interval(Duration::from_secs(self.config.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    async fn check_all(&self) {
        for backend in self.registry.all_backends() {
            if self.check(&backend).await {
                if backend.reinstate() {
                    tracing::info!(
                        vhost = %backend.virtual_host(),
                        backend = %backend.authority(),
                        "Backend reinstated by health check"
                    );
                }
            } else if self.registry.mark_dead(&backend) == DemotionOutcome::Demoted {
                tracing::warn!(
                    vhost = %backend.virtual_host(),
                    backend = %backend.authority(),
                    "Backend demoted by health check"
                );
            }
        }
    }

    async fn check(&self, backend: &Backend) -> bool {
        let uri = format!("{}{}", backend.url(), self.config.path);
        let request = match Request::builder()
            .method("GET")
            .uri(uri)
            .header("host", backend.virtual_host())
            .header("user-agent", "route-machine-health-check")
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(e) => {
                tracing::error!("Failed to build health check request: {}", e);
                return false;
            }
        };

        let timeout = Duration::from_secs(self.config.timeout_secs);
        match time::timeout(timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let healthy = !response.status().is_server_error();
                if !healthy {
                    tracing::warn!(addr = %backend.authority(), status = %response.status(), "Health check failed: server error");
                }
                healthy
            }
            Ok(Err(e)) => {
                tracing::warn!(addr = %backend.authority(), error = %e, "Health check failed: connection error");
                false
            }
            Err(_) => {
                tracing::warn!(addr = %backend.authority(), "Health check failed: timeout");
                false
            }
        }
    }
}
