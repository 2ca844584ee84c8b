//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (reuseport accept loop, one per address)
//!     → connection.rs (byte counters, idle detection, state)
//!     → Hand off to HTTP layer
//!
//! Connection States:
//!     Active → TimedOut | Closed
//! ```
//!
//! # Design Decisions
//! - Every worker binds the same port; the kernel spreads connections
//! - Keep-alive disabled; one request per client connection
//! - Idle timeout is surfaced to in-flight requests as a transport error

pub mod connection;
pub mod listener;

pub use connection::{idle_timeout, ConnectionHandle, ConnectionState, MeteredStream};
pub use listener::{bind_all, Listener, ListenerError};
