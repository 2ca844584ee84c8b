//! Prometheus metrics exposition for aggregated traffic.
//!
//! # Metrics
//! - `route_machine_requests_total` (counter): requests by vhost
//! - `route_machine_bytes_written_total` (counter): bytes sent to clients
//! - `route_machine_bytes_read_total` (counter): bytes received from clients
//! - `route_machine_response_time_ms` (gauge): mean response time of the last interval
//!
//! Every series is labelled with `vhost` and `token` (the metrics session).

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

use crate::cluster::aggregate::{MetricsRecord, MetricsSink};

/// Install the Prometheus exporter and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    let builder = PrometheusBuilder::new();
    match builder.with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install Prometheus recorder"),
    }
}

/// `MetricsSink` that records into the global `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusSink;

impl MetricsSink for PrometheusSink {
    fn publish(&mut self, record: &MetricsRecord) {
        let vhost = record.virtual_host.clone();
        let token = record.metrics_session.clone().unwrap_or_default();

        counter!("route_machine_requests_total", "vhost" => vhost.clone(), "token" => token.clone())
            .increment(record.count);
        counter!("route_machine_bytes_written_total", "vhost" => vhost.clone(), "token" => token.clone())
            .increment(record.bytes_written);
        counter!("route_machine_bytes_read_total", "vhost" => vhost.clone(), "token" => token.clone())
            .increment(record.bytes_read);
        gauge!("route_machine_response_time_ms", "vhost" => vhost, "token" => token)
            .set(record.response_time);
    }
}
