//! Worker process runtime.
//!
//! A worker owns one registry, one HTTP server bound to the shared port,
//! a control bus subscription and a stats timer. Everything it reports
//! goes to the supervisor through the IPC channel on stdout.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::bus::BusClient;
use crate::cluster::ipc::{pump, IpcSender, WorkerMessage};
use crate::config::ProxyConfig;
use crate::health::active::HealthMonitor;
use crate::http::{HttpServer, HyperForwarder, Pipeline};
use crate::lifecycle::{wait_for_termination, Shutdown};
use crate::net::{bind_all, ListenerError};
use crate::registry::BackendRegistry;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// Run a worker until it is signalled or its supervisor goes away.
pub async fn run(
    config: ProxyConfig,
    ipc: IpcSender,
    outbox: mpsc::UnboundedReceiver<WorkerMessage>,
) -> Result<(), WorkerError> {
    let mut pump_task = tokio::spawn(pump(outbox, tokio::io::stdout()));

    let registry = Arc::new(BackendRegistry::new(config.server.dead_backend_ttl()));
    let uid = uuid::Uuid::new_v4().to_string();
    let shutdown = Shutdown::new();

    let listeners = bind_all(&config.listener)?;
    let pipeline = Arc::new(Pipeline::new(
        &config,
        registry.clone(),
        Arc::new(HyperForwarder::new(&config.server)),
        Arc::new(ipc.clone()),
    ));
    let server_task = tokio::spawn(HttpServer::new(pipeline).run(listeners, shutdown.clone()));

    tokio::spawn(report_stats(
        registry.clone(),
        ipc.clone(),
        Duration::from_millis(config.stats.interval_ms),
        shutdown.subscribe(),
    ));

    if config.bus.enabled {
        let bus = BusClient::new(config.bus.clone(), registry.clone(), uid.clone());
        tokio::spawn(bus.run(shutdown.subscribe()));
    }

    if config.health_check.enabled && !config.active_health_checks() {
        tracing::warn!(
            "Active health checks disabled: server.dead_backend_ttl_secs is 0 so backends are never demoted"
        );
    }
    if config.active_health_checks() {
        let monitor = HealthMonitor::new(registry.clone(), config.health_check.clone());
        tokio::spawn(monitor.run(shutdown.subscribe()));
    }

    tracing::info!(uid = %uid, pid = ipc.pid(), "Worker ready");

    tokio::select! {
        res = wait_for_termination() => match res {
            Ok(signal) => tracing::info!(signal = %signal, "Worker stopping"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for signals"),
        },
        res = &mut pump_task => {
            // No supervisor to talk to; nothing left to do.
            if let Ok(Err(e)) = res {
                eprintln!("route-machine worker {}: {}", ipc.pid(), e);
            }
        }
    }

    shutdown.trigger();
    let _ = server_task.await;
    Ok(())
}

async fn report_stats(
    registry: Arc<BackendRegistry>,
    ipc: IpcSender,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if ipc.stats(registry.snapshot()).is_err() {
                    break;
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BackendDescriptor;

    #[tokio::test(start_paused = true)]
    async fn stats_are_reported_every_interval() {
        let registry = Arc::new(BackendRegistry::default());
        registry.register(
            "app.test",
            &BackendDescriptor {
                hostname: "10.0.0.1".into(),
                port: 80,
                ..Default::default()
            },
        );
        let (ipc, mut rx) = IpcSender::channel(5);
        let shutdown = Shutdown::new();

        let task = tokio::spawn(report_stats(
            registry,
            ipc,
            Duration::from_millis(1000),
            shutdown.subscribe(),
        ));

        let first = rx.recv().await.unwrap();
        match first {
            WorkerMessage::Stats { from, data } => {
                assert_eq!(from, 5);
                assert!(data.hosts.contains_key("app.test"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(WorkerMessage::Stats { .. })));

        shutdown.trigger();
        task.await.unwrap();
    }
}
