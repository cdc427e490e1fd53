//! podgrid-state — in-memory state for the podgrid scheduler.
//!
//! Holds the node pool, the per-workload-type pending queues and the
//! request records that track each submission from pending to a
//! terminal status.
//!
//! # Architecture
//!
//! ```text
//! Registry
//!   ├── nodes: Vec<Node>               (registration order)
//!   ├── pending: type → VecDeque<id>   (FIFO per workload type)
//!   ├── requests: id → WorkloadRequest (plus finish time for retention)
//!   └── provisioning: {type}           (one sequence in flight per type)
//! ```
//!
//! `Registry` is not internally synchronized. The scheduler owns exactly
//! one behind a mutex, so independent schedulers never share state.

pub mod error;
pub mod registry;
pub mod types;

pub use error::{StateError, StateResult};
pub use registry::{Registry, RegistrySnapshot, RetentionPolicy};
pub use types::*;
