//! Backend registry subsystem.
//!
//! # Data Flow
//! ```text
//! Control bus register/unregister
//!     → table.rs (normalize vhost, mutate pool)
//!
//! Request Host header
//!     → table.rs (normalize, look up pool)
//!     → pool.rs (rotate-on-read round robin, skip demoted)
//!     → backend.rs (selected backend, traffic counters)
//!
//! Stats timer
//!     → table.rs snapshot (drain counters per pool)
//!     → stats.rs StatsSnapshot → supervisor
//! ```
//!
//! # Design Decisions
//! - One registry per worker process, never shared across processes
//! - Registry state is volatile and rebuilt from bus messages
//! - Rotation mutates the pool, so a retry naturally lands on the next backend
//! - Empty pools are kept to distinguish "no backend" from "unknown host"

pub mod backend;
pub mod pool;
pub mod stats;
pub mod table;

pub use backend::{Backend, BackendDescriptor, BackendInfo};
pub use pool::VirtualHostPool;
pub use stats::{StatsSnapshot, VhostStats};
pub use table::{
    normalize_host, BackendRegistry, DemotionOutcome, RegistryEvent, RouteError, Selection,
    PING_HOST,
};
