//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → wait_for_termination resolves
//!
//! Shutdown (shutdown.rs):
//!     trigger() → listeners stop accepting, bus client and timers exit
//! ```
//!
//! # Design Decisions
//! - Supervisor kills workers on termination; workers do not drain
//! - Workers exit when their stdout (the IPC channel) is gone

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::{wait_for_termination, Termination};
