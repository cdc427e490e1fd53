//! podgrid-health — node readiness detection.
//!
//! A freshly created node is only handed out once two things hold: the
//! provider reports it running with the service port published, and the
//! service itself answers its health endpoint.
//!
//! ```text
//! ReadinessProber
//!   ├── phase 1: ComputeProvider::describe_node  (status + port mapping)
//!   └── phase 2: ServiceProbe::check             (HTTP GET health path)
//! ```

pub mod checker;
pub mod readiness;

pub use checker::{HttpServiceProbe, ProbeResult, ServiceProbe, classify, http_probe};
pub use readiness::{
    ReadinessError, ReadinessPhase, ReadinessProber, ReadinessSettings, ReadyNode,
};
