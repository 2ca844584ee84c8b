//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Passive health checks (passive.rs):
//!     Backend response status / transport failure observed
//!     → classify()
//!     → BackendRegistry::mark_dead
//!
//! Active health checks (active.rs, optional):
//!     Periodic timer
//!     → Check each registered backend
//!     → mark_dead on failure, reinstate on success
//!
//! Demotion state (state.rs):
//!     Alive ←→ Demoted (TTL)
//! ```
//!
//! # Design Decisions
//! - Active and passive checks are complementary
//! - Demotion is time-boxed; a backend is reinstated lazily once its TTL elapses
//! - Health state is per-backend, not per-pool

pub mod active;
pub mod passive;
pub mod state;

pub use passive::{classify, StatusPolicy, Verdict};
