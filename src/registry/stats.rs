//! Per-interval traffic snapshots sent from workers to the supervisor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Traffic totals for one virtual host over one interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VhostStats {
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub count: u64,
    /// Mean response time in milliseconds.
    #[serde(rename = "rt")]
    pub response_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_session: Option<String>,
}

/// One worker's stats for one interval, keyed by virtual host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatsSnapshot {
    pub hosts: BTreeMap<String, VhostStats>,
}

impl StatsSnapshot {
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
