//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Worker:
//!     tracing events → logging.rs (IPC writer) → supervisor stdout
//!     completed requests → access_log.rs records → IPC
//!
//! Supervisor:
//!     worker logs and access records → tracing (stdout)
//!     aggregated stats → metrics.rs → Prometheus scrape endpoint
//! ```

pub mod access_log;
pub mod logging;
pub mod metrics;

pub use access_log::{AccessLogSink, AccessRecord, TracingAccessLog};
