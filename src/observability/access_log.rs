//! Access log records.
//!
//! Workers hand each record to the supervisor over IPC; the supervisor
//! writes them on the `access_log` tracing target.

use serde::{Deserialize, Serialize};

/// One completed (or failed) proxied request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRecord {
    pub remote_addr: String,
    /// Request start, Unix milliseconds.
    pub current_time: u64,
    pub total_time_spent: u64,
    pub backend_time_spent: u64,
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub status_code: u16,
    pub socket_bytes_written: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub virtual_host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_session: Option<String>,
    /// The response was generated by the router rather than a backend.
    #[serde(default)]
    pub error: bool,
}

/// Destination for access records.
pub trait AccessLogSink: Send + Sync {
    fn record(&self, record: AccessRecord);
}

/// Writes records as structured events on the `access_log` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAccessLog;

impl AccessLogSink for TracingAccessLog {
    fn record(&self, record: AccessRecord) {
        tracing::info!(
            target: "access_log",
            remote_addr = %record.remote_addr,
            time = record.current_time,
            method = %record.method,
            url = %record.url,
            http_version = %record.http_version,
            status = record.status_code,
            bytes_written = record.socket_bytes_written,
            total_ms = record.total_time_spent,
            backend_ms = record.backend_time_spent,
            referer = record.referer.as_deref().unwrap_or("-"),
            user_agent = record.user_agent.as_deref().unwrap_or("-"),
            vhost = %record.virtual_host,
            log_session = record.log_session.as_deref().unwrap_or("-"),
            error = record.error,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_camel_case_keys() {
        let record = AccessRecord {
            remote_addr: "10.0.0.1".into(),
            current_time: 1,
            total_time_spent: 12,
            backend_time_spent: 10,
            method: "GET".into(),
            url: "/".into(),
            http_version: "1.1".into(),
            status_code: 200,
            socket_bytes_written: 512,
            referer: None,
            user_agent: Some("curl/8".into()),
            virtual_host: "app.test".into(),
            log_session: Some("tok".into()),
            error: false,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["remoteAddr"], "10.0.0.1");
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["logSession"], "tok");
        assert!(json.get("referer").is_none());
    }
}
