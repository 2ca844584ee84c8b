//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (net)
//!     → server.rs (hyper http1, keep-alive off, Axum router)
//!     → websocket.rs for upgrade requests
//!     → pipeline.rs: headers.rs (X-Forwarded-*) → registry select
//!         → forward.rs (backend round trip) → classify / retry
//!     → response.rs (debug headers, error pages)
//!     → Send to client, access record on completion
//! ```

pub mod context;
pub mod forward;
pub mod headers;
pub mod pipeline;
pub mod response;
pub mod server;
pub mod websocket;

pub use context::RequestContext;
pub use forward::{ForwardError, Forwarder, HyperForwarder};
pub use pipeline::{Phase, Pipeline, PipelineError};
pub use server::HttpServer;
