//! Resilience patterns subsystem.
//!
//! # Components
//! - `retries`: bounded retry of failed forwarding attempts
//! - `backoff`: jittered exponential delay for control bus reconnects
//!   and worker respawn failures
//!
//! # Design Decisions
//! - Request retries are immediate; another backend is selected each time
//! - Only transport failures are retried, never backend 5xx responses

pub mod backoff;
pub mod retries;

pub use backoff::{calculate_backoff, Backoff};
pub use retries::{RetryDecision, RetryPolicy};
