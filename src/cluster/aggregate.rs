//! Cluster-wide stats aggregation.
//!
//! Every live worker sends one snapshot per interval. Totals accumulate
//! until as many snapshots as live workers have arrived, then one record
//! per virtual host is flushed and the totals reset. Response times are
//! averaged over the snapshots received (a mean of per-worker means).

use std::collections::BTreeMap;

use crate::registry::StatsSnapshot;

/// Aggregated traffic of one virtual host over one interval.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsRecord {
    pub virtual_host: String,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub count: u64,
    /// Mean response time in milliseconds.
    pub response_time: f64,
    pub metrics_session: Option<String>,
}

/// Destination for aggregated records.
pub trait MetricsSink: Send {
    fn publish(&mut self, record: &MetricsRecord);
}

#[derive(Debug, Default)]
struct Totals {
    bytes_written: u64,
    bytes_read: u64,
    count: u64,
    response_time_sum: f64,
    metrics_session: Option<String>,
}

#[derive(Debug, Default)]
pub struct AggregateMetrics {
    totals: BTreeMap<String, Totals>,
    reports: usize,
}

impl AggregateMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots merged since the last flush.
    pub fn reports(&self) -> usize {
        self.reports
    }

    /// Merge one worker's snapshot. Returns the flushed records once
    /// `live_workers` snapshots have been merged.
    pub fn merge(&mut self, snapshot: &StatsSnapshot, live_workers: usize) -> Option<Vec<MetricsRecord>> {
        for (vhost, stats) in &snapshot.hosts {
            let totals = self.totals.entry(vhost.clone()).or_default();
            totals.bytes_written += stats.bytes_written;
            totals.bytes_read += stats.bytes_read;
            totals.count += stats.count;
            totals.response_time_sum += stats.response_time;
            if totals.metrics_session.is_none() {
                totals.metrics_session = stats.metrics_session.clone();
            }
        }
        self.reports += 1;

        if self.reports < live_workers {
            return None;
        }
        Some(self.flush())
    }

    fn flush(&mut self) -> Vec<MetricsRecord> {
        let reports = self.reports.max(1) as f64;
        let records = std::mem::take(&mut self.totals)
            .into_iter()
            .map(|(virtual_host, t)| MetricsRecord {
                virtual_host,
                bytes_written: t.bytes_written,
                bytes_read: t.bytes_read,
                count: t.count,
                response_time: t.response_time_sum / reports,
                metrics_session: t.metrics_session,
            })
            .collect();
        self.reports = 0;
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::VhostStats;

    fn snapshot(count: u64, rt: f64) -> StatsSnapshot {
        let mut snapshot = StatsSnapshot::default();
        snapshot.hosts.insert(
            "app.test".into(),
            VhostStats {
                bytes_written: 100,
                bytes_read: 10,
                count,
                response_time: rt,
                metrics_session: Some("m-token".into()),
            },
        );
        snapshot
    }

    #[test]
    fn flushes_once_every_worker_reported() {
        let mut agg = AggregateMetrics::new();

        assert!(agg.merge(&snapshot(1, 10.0), 3).is_none());
        assert!(agg.merge(&snapshot(2, 20.0), 3).is_none());
        let records = agg.merge(&snapshot(3, 30.0), 3).unwrap();

        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.virtual_host, "app.test");
        assert_eq!(r.count, 6);
        assert_eq!(r.bytes_written, 300);
        assert_eq!(r.bytes_read, 30);
        assert!((r.response_time - 20.0).abs() < f64::EPSILON);
        assert_eq!(r.metrics_session.as_deref(), Some("m-token"));

        // totals reset after a flush
        assert_eq!(agg.reports(), 0);
        assert!(agg.merge(&snapshot(1, 5.0), 3).is_none());
    }

    #[test]
    fn shrinking_cluster_flushes_early() {
        let mut agg = AggregateMetrics::new();
        assert!(agg.merge(&snapshot(1, 10.0), 3).is_none());
        // a worker died; two live workers and two reports
        let records = agg.merge(&snapshot(1, 30.0), 2).unwrap();
        assert!((records[0].response_time - 20.0).abs() < f64::EPSILON);
    }

    struct Collect(Vec<MetricsRecord>);

    impl MetricsSink for Collect {
        fn publish(&mut self, record: &MetricsRecord) {
            self.0.push(record.clone());
        }
    }

    #[test]
    fn sink_receives_one_record_per_vhost() {
        let mut agg = AggregateMetrics::new();
        let mut two_hosts = snapshot(1, 1.0);
        two_hosts.hosts.insert("other.test".into(), VhostStats::default());

        let mut sink = Collect(Vec::new());
        for record in agg.merge(&two_hosts, 1).unwrap() {
            sink.publish(&record);
        }
        assert_eq!(sink.0.len(), 2);
    }
}
