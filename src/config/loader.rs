//! Configuration loading from disk.

use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::config::schema::ProxyConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<ProxyConfig, ConfigError> {
    let config: ProxyConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.server.workers, 2);
        assert_eq!(config.server.retry_on_error, 2);
        assert_eq!(config.listener.port, 1080);
        assert_eq!(config.bus.subject_prefix, "router");
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = parse_config(
            r#"
            [server]
            workers = 4
            dead_backend_on_500 = false

            [listener]
            port = 8080
            addresses = ["127.0.0.1", "::1"]
            "#,
        )
        .unwrap();

        assert_eq!(config.server.workers, 4);
        assert!(!config.server.dead_backend_on_500);
        assert_eq!(config.server.tcp_timeout_secs, 30);
        assert_eq!(config.listener.socket_addrs().unwrap().len(), 2);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = parse_config(
            r#"
            [server]
            workers = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
