//! Per-request state carried through the pipeline.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::registry::Backend;

/// Everything the pipeline knows about one inbound request.
#[derive(Debug)]
pub struct RequestContext {
    pub started_at: SystemTime,
    pub start: Instant,
    /// Set when the current forwarding attempt is dispatched.
    pub backend_start: Option<Instant>,
    /// Set once, when response headers are first received.
    pub headers_at: Option<Instant>,

    pub backend: Option<Arc<Backend>>,
    /// Normalized host key the request matched.
    pub frontend: Option<String>,

    /// Failed forwarding attempts so far.
    pub failures: u32,
    pub debug: bool,
    pub headers_sent: bool,
    pub error_response: bool,
}

impl RequestContext {
    pub fn new(debug: bool) -> Self {
        Self {
            started_at: SystemTime::now(),
            start: Instant::now(),
            backend_start: None,
            headers_at: None,
            backend: None,
            frontend: None,
            failures: 0,
            debug,
            headers_sent: false,
            error_response: false,
        }
    }

    pub fn select(&mut self, backend: Arc<Backend>, frontend: String) {
        self.backend = Some(backend);
        self.frontend = Some(frontend);
    }

    pub fn begin_attempt(&mut self) {
        self.backend_start = Some(Instant::now());
    }

    /// Stamp `headers_at`. Returns false if headers were already seen.
    pub fn mark_headers(&mut self) -> bool {
        if self.headers_sent {
            return false;
        }
        self.headers_sent = true;
        self.headers_at = Some(Instant::now());
        true
    }

    pub fn total_elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn backend_elapsed(&self) -> Duration {
        self.backend_start
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    /// Time from request start until response headers arrived.
    pub fn time_to_headers(&self) -> Duration {
        self.headers_at
            .map(|t| t.duration_since(self.start))
            .unwrap_or_default()
    }

    /// Time from backend dispatch until response headers arrived.
    pub fn backend_time_to_headers(&self) -> Duration {
        match (self.backend_start, self.headers_at) {
            (Some(start), Some(end)) => end.duration_since(start),
            _ => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_stamped_once() {
        let mut ctx = RequestContext::new(false);
        ctx.begin_attempt();
        assert!(ctx.mark_headers());
        let first = ctx.headers_at;
        assert!(!ctx.mark_headers());
        assert_eq!(ctx.headers_at, first);
        assert!(ctx.time_to_headers() >= ctx.backend_time_to_headers());
    }
}
