//! Backend demotion state.
//!
//! # States
//! - Alive: backend takes part in round-robin rotation
//! - Demoted: backend is skipped by selection until its deadline passes
//!
//! # State Transitions
//! ```text
//! Alive → Demoted: mark_dead with a non-zero TTL
//! Demoted → Alive: deadline elapses (checked lazily on read) or reinstate()
//! ```
//!
//! # Design Decisions
//! - Deadline stored as an atomic offset from a process-wide epoch
//! - Reads and writes never block the request path

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed since the process-wide epoch, offset by one so
/// that zero can mean "not demoted".
fn now_ms() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u64 + 1
}

/// Demotion deadline for a single backend.
#[derive(Debug, Default)]
pub struct Demotion {
    /// 0 = alive, otherwise the epoch offset at which the backend is reinstated.
    dead_until: AtomicU64,
}

impl Demotion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the backend out of rotation for `ttl`.
    ///
    /// Returns false if the backend was already demoted (the deadline is
    /// left untouched so repeated failures do not extend the cooldown).
    pub fn demote(&self, ttl: Duration) -> bool {
        if ttl.is_zero() || self.is_demoted() {
            return false;
        }
        let until = now_ms().saturating_add(ttl.as_millis() as u64);
        self.dead_until.store(until, Ordering::Relaxed);
        true
    }

    /// Put the backend back into rotation immediately.
    pub fn reinstate(&self) -> bool {
        self.dead_until.swap(0, Ordering::Relaxed) != 0
    }

    pub fn is_demoted(&self) -> bool {
        let until = self.dead_until.load(Ordering::Relaxed);
        until != 0 && now_ms() < until
    }
}
