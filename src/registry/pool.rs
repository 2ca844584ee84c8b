//! Virtual host pool with rotate-on-read round-robin.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::registry::backend::Backend;
use crate::registry::stats::VhostStats;

/// Ordered set of backends serving one virtual host.
///
/// The front of the queue is the next backend handed out; selection moves
/// it to the back. No two entries share a `(hostname, port)` pair.
#[derive(Debug, Default)]
pub struct VirtualHostPool {
    backends: VecDeque<Arc<Backend>>,
}

impl VirtualHostPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn contains(&self, hostname: &str, port: u16) -> bool {
        self.backends.iter().any(|b| b.is(hostname, port))
    }

    /// Append a backend unless its `(hostname, port)` is already present.
    pub fn push(&mut self, backend: Arc<Backend>) -> bool {
        if self.contains(backend.hostname(), backend.port()) {
            return false;
        }
        self.backends.push_back(backend);
        true
    }

    pub fn remove(&mut self, hostname: &str, port: u16) -> Option<Arc<Backend>> {
        let pos = self.backends.iter().position(|b| b.is(hostname, port))?;
        self.backends.remove(pos)
    }

    /// Hand out the next backend and move it to the back of the rotation.
    ///
    /// Demoted backends are passed over. When every member is demoted the
    /// head is returned anyway.
    pub fn rotate(&mut self) -> Option<Arc<Backend>> {
        let len = self.backends.len();
        for _ in 0..len {
            let backend = self.backends.pop_front()?;
            self.backends.push_back(backend.clone());
            if !backend.is_demoted() {
                return Some(backend);
            }
        }

        let backend = self.backends.pop_front()?;
        self.backends.push_back(backend.clone());
        Some(backend)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.backends.iter()
    }

    /// Sum and reset the counters of every member.
    ///
    /// Returns `None` for an empty pool.
    pub fn drain_stats(&self) -> Option<VhostStats> {
        let first = self.backends.front()?;
        let mut stats = VhostStats {
            metrics_session: first.metrics_session().map(str::to_string),
            ..Default::default()
        };

        let mut rt_sum = 0u64;
        let mut rt_samples = 0u64;
        for backend in &self.backends {
            let b = backend.take_stats();
            stats.bytes_written += b.bytes_written;
            stats.bytes_read += b.bytes_read;
            stats.count += b.count;
            rt_sum += b.response_time_sum;
            rt_samples += b.response_time_samples;
        }
        if rt_samples > 0 {
            stats.response_time = rt_sum as f64 / rt_samples as f64;
        }
        Some(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::backend::BackendDescriptor;
    use std::time::Duration;

    fn backend(port: u16) -> Arc<Backend> {
        Arc::new(Backend::new(
            "app.example.com",
            BackendDescriptor {
                hostname: "10.0.0.1".into(),
                port,
                ..Default::default()
            },
        ))
    }

    #[test]
    fn test_round_robin() {
        let mut pool = VirtualHostPool::new();
        pool.push(backend(8080));
        pool.push(backend(8081));

        assert_eq!(pool.rotate().unwrap().port(), 8080);
        assert_eq!(pool.rotate().unwrap().port(), 8081);
        assert_eq!(pool.rotate().unwrap().port(), 8080);
    }

    #[test]
    fn rotate_skips_demoted() {
        let mut pool = VirtualHostPool::new();
        let a = backend(8080);
        pool.push(a.clone());
        pool.push(backend(8081));
        a.demote(Duration::from_secs(60));

        assert_eq!(pool.rotate().unwrap().port(), 8081);
        assert_eq!(pool.rotate().unwrap().port(), 8081);
    }

    #[test]
    fn rotate_fails_open_when_all_demoted() {
        let mut pool = VirtualHostPool::new();
        let a = backend(8080);
        let b = backend(8081);
        pool.push(a.clone());
        pool.push(b.clone());
        a.demote(Duration::from_secs(60));
        b.demote(Duration::from_secs(60));

        assert_eq!(pool.rotate().unwrap().port(), 8080);
        assert_eq!(pool.rotate().unwrap().port(), 8081);
    }

    #[test]
    fn drain_stats_averages_over_all_samples() {
        let mut pool = VirtualHostPool::new();
        let a = backend(8080);
        let b = backend(8081);
        pool.push(a.clone());
        pool.push(b.clone());

        a.record(10, 1, Duration::from_millis(10));
        a.record(10, 1, Duration::from_millis(20));
        b.record(5, 2, Duration::from_millis(60));

        let stats = pool.drain_stats().unwrap();
        assert_eq!(stats.bytes_written, 25);
        assert_eq!(stats.bytes_read, 4);
        assert_eq!(stats.count, 3);
        assert!((stats.response_time - 30.0).abs() < f64::EPSILON);

        let empty = pool.drain_stats().unwrap();
        assert_eq!(empty.count, 0);
        assert_eq!(empty.response_time, 0.0);
    }
}
