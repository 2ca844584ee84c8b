//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single registered backend instance
//! - Carry the descriptor published on the control bus
//! - Accumulate traffic counters between stats snapshots
//! - Track demotion state

use serde::{Deserialize, Deserializer, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::health::state::Demotion;

/// Registration payload for a backend, as published on the control bus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub hostname: String,
    pub port: u16,

    #[serde(default, deserialize_with = "string_or_number")]
    pub instance_id: String,

    /// Ordinal among sibling instances at registration time.
    #[serde(default)]
    pub index: u32,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ps_type: Option<String>,

    /// Correlation token for the access log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_session: Option<String>,

    /// Correlation token for aggregated metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_session: Option<String>,

    /// Virtual hosts served by this instance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uris: Vec<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Str(String),
        Num(i64),
    }

    Ok(match Option::<Id>::deserialize(deserializer)? {
        Some(Id::Str(s)) => s,
        Some(Id::Num(n)) => n.to_string(),
        None => String::new(),
    })
}

/// Introspection view of a registered backend, served to `list` queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub hostname: String,
    pub port: u16,
    pub instance_id: String,
    pub index: u32,
    pub virtual_host: String,
    pub name: String,
    pub app_id: Option<String>,
    pub ps_type: Option<String>,
    pub log_session: Option<String>,
    pub metrics_session: Option<String>,
    pub demoted: bool,
}

/// Counters drained from a backend by a stats snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BackendStats {
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub count: u64,
    pub response_time_sum: u64,
    pub response_time_samples: u64,
}

/// A single backend server behind a virtual host.
#[derive(Debug)]
pub struct Backend {
    descriptor: BackendDescriptor,
    virtual_host: String,

    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    count: AtomicU64,
    /// Round-trip times in milliseconds observed since the last snapshot.
    response_times: Mutex<Vec<u64>>,

    demotion: Demotion,
}

impl Backend {
    /// Create a new backend for the given (already normalized) virtual host.
    pub fn new(virtual_host: impl Into<String>, mut descriptor: BackendDescriptor) -> Self {
        descriptor.uris.clear();
        Self {
            descriptor,
            virtual_host: virtual_host.into(),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            count: AtomicU64::new(0),
            response_times: Mutex::new(Vec::new()),
            demotion: Demotion::new(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.descriptor.hostname
    }

    pub fn port(&self) -> u16 {
        self.descriptor.port
    }

    pub fn instance_id(&self) -> &str {
        &self.descriptor.instance_id
    }

    pub fn virtual_host(&self) -> &str {
        &self.virtual_host
    }

    pub fn log_session(&self) -> Option<&str> {
        self.descriptor.log_session.as_deref()
    }

    pub fn metrics_session(&self) -> Option<&str> {
        self.descriptor.metrics_session.as_deref()
    }

    /// Return true if this backend is the `(hostname, port)` pair given.
    pub fn is(&self, hostname: &str, port: u16) -> bool {
        self.descriptor.port == port && self.descriptor.hostname == hostname
    }

    /// `host:port` authority used to reach the backend.
    pub fn authority(&self) -> String {
        if self.descriptor.hostname.contains(':') {
            format!("[{}]:{}", self.descriptor.hostname, self.descriptor.port)
        } else {
            format!("{}:{}", self.descriptor.hostname, self.descriptor.port)
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.authority())
    }

    // --- Traffic counters ---

    /// Record one completed request.
    pub fn record(&self, bytes_written: u64, bytes_read: u64, response_time: Duration) {
        self.bytes_written.fetch_add(bytes_written, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes_read, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut times) = self.response_times.lock() {
            times.push(response_time.as_millis() as u64);
        }
    }

    /// Drain the running counters.
    pub fn take_stats(&self) -> BackendStats {
        let times = match self.response_times.lock() {
            Ok(mut times) => std::mem::take(&mut *times),
            Err(_) => Vec::new(),
        };
        BackendStats {
            bytes_written: self.bytes_written.swap(0, Ordering::Relaxed),
            bytes_read: self.bytes_read.swap(0, Ordering::Relaxed),
            count: self.count.swap(0, Ordering::Relaxed),
            response_time_sum: times.iter().sum(),
            response_time_samples: times.len() as u64,
        }
    }

    // --- Demotion ---

    pub fn is_demoted(&self) -> bool {
        self.demotion.is_demoted()
    }

    pub fn demote(&self, ttl: Duration) -> bool {
        self.demotion.demote(ttl)
    }

    pub fn reinstate(&self) -> bool {
        self.demotion.reinstate()
    }

    pub fn info(&self) -> BackendInfo {
        BackendInfo {
            hostname: self.descriptor.hostname.clone(),
            port: self.descriptor.port,
            instance_id: self.descriptor.instance_id.clone(),
            index: self.descriptor.index,
            virtual_host: self.virtual_host.clone(),
            name: self.descriptor.name.clone(),
            app_id: self.descriptor.app_id.clone(),
            ps_type: self.descriptor.ps_type.clone(),
            log_session: self.descriptor.log_session.clone(),
            metrics_session: self.descriptor.metrics_session.clone(),
            demoted: self.is_demoted(),
        }
    }
}
