//! Passive health checking (failure detection from live traffic).
//!
//! # Responsibilities
//! - Classify backend response statuses as healthy, maintenance or failing
//!
//! # Design Decisions
//! - Pure function of (status, headers, policy); no state
//! - 4xx are NOT failures (client error, not backend)
//! - 500 only counts when configured and no active checker is running
//! - 503 with Retry-After is planned maintenance

use axum::http::{header, HeaderMap, StatusCode};

use crate::config::ProxyConfig;

/// Inputs to status classification that come from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPolicy {
    pub dead_backend_on_500: bool,
    pub active_checks: bool,
}

impl StatusPolicy {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            dead_backend_on_500: config.server.dead_backend_on_500,
            active_checks: config.active_health_checks(),
        }
    }

    /// Lowest status code treated as a dead-backend signal.
    pub fn first_dead_status(&self) -> u16 {
        if self.dead_backend_on_500 && !self.active_checks {
            500
        } else {
            501
        }
    }
}

/// Outcome of classifying a backend response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// 503 carrying Retry-After.
    Maintenance,
    Failing,
}

impl Verdict {
    pub fn is_failing(self) -> bool {
        matches!(self, Verdict::Failing)
    }
}

/// Classify a backend response by status and headers.
pub fn classify(status: StatusCode, headers: &HeaderMap, policy: &StatusPolicy) -> Verdict {
    let code = status.as_u16();
    if code < policy.first_dead_status() || code >= 600 {
        return Verdict::Healthy;
    }
    if status == StatusCode::SERVICE_UNAVAILABLE && headers.contains_key(header::RETRY_AFTER) {
        return Verdict::Maintenance;
    }
    Verdict::Failing
}
