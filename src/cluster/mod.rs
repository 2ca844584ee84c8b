//! Multi-process cluster subsystem.
//!
//! # Data Flow
//! ```text
//! supervisor.rs
//!     spawn N × `route-machine worker` → worker.rs
//!     worker stdout (ipc.rs JSON lines) → log / access log / stats
//!     stats → aggregate.rs barrier → MetricsSink
//!     worker exit → respawn
//! ```

pub mod aggregate;
pub mod ipc;
pub mod supervisor;
pub mod worker;

pub use aggregate::{AggregateMetrics, MetricsRecord, MetricsSink};
pub use ipc::{IpcError, IpcSender, WorkerMessage};
pub use supervisor::{ClusterSupervisor, SupervisorError, WorkerCommand, WorkerState};
