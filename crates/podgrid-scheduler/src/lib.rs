//! podgrid-scheduler — GPU worker-pool scheduling.
//!
//! Matches queued, type-tagged workloads to leased compute nodes. The
//! scheduler:
//!
//! - Assigns pending requests to nodes with free capacity
//! - Provisions nodes on demand, falling back across hardware variants
//! - Pauses idle nodes and terminates long-paused ones
//! - Tracks each request from pending to a terminal status
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   ├── Registry (single lock: nodes, queues, requests)
//!   ├── Provisioner
//!   │   ├── ComputeProvider (create / terminate)
//!   │   └── ReadinessProber (infra phase, service phase)
//!   └── Sweeper (pause / terminate, SweepPolicy)
//! ```

pub mod error;
pub mod provisioner;
pub mod scheduler;
pub mod sweep;

pub use error::{SchedulerError, SchedulerResult};
pub use provisioner::Provisioner;
pub use scheduler::{NodeConnection, Scheduler, SchedulerSettings, SchedulerStatus, TickReport};
pub use sweep::{SweepReport, Sweeper};
