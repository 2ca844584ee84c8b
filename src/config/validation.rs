//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, at least one worker)
//! - Check that listen and bus addresses parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::ProxyConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.workers == 0 {
        errors.push(ValidationError::new("server.workers", "must be at least 1"));
    }
    if config.server.max_sockets == 0 {
        errors.push(ValidationError::new("server.max_sockets", "must be at least 1"));
    }
    if config.server.tcp_timeout_secs == 0 {
        errors.push(ValidationError::new("server.tcp_timeout_secs", "must be greater than 0"));
    }
    if config.server.backend_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "server.backend_timeout_secs",
            "must be greater than 0",
        ));
    }

    if config.listener.addresses.is_empty() {
        errors.push(ValidationError::new("listener.addresses", "at least one address is required"));
    }
    if let Err(e) = config.listener.socket_addrs() {
        errors.push(ValidationError::new("listener.addresses", e.to_string()));
    }

    if config.bus.enabled && config.bus.address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "bus.address",
            format!("invalid socket address '{}'", config.bus.address),
        ));
    }
    if config.bus.subject_prefix.is_empty() {
        errors.push(ValidationError::new("bus.subject_prefix", "must not be empty"));
    }

    if config.stats.interval_ms == 0 {
        errors.push(ValidationError::new("stats.interval_ms", "must be greater than 0"));
    }

    if config.health_check.enabled && config.health_check.interval_secs == 0 {
        errors.push(ValidationError::new(
            "health_check.interval_secs",
            "must be greater than 0",
        ));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid socket address '{}'", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
