//! Scheduler error types.

use podgrid_health::ReadinessError;
use podgrid_provider::ProviderError;
use podgrid_state::{RequestStatus, StateError};
use thiserror::Error;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("provider call {op} failed: {source}")]
    ProviderCallFailed {
        op: &'static str,
        #[source]
        source: ProviderError,
    },

    #[error("node readiness failed: {0}")]
    ReadinessTimeout(#[from] ReadinessError),

    #[error("unknown request: {0}")]
    UnknownRequest(String),

    #[error("request {id} is already {status}")]
    AlreadyTerminal { id: String, status: RequestStatus },

    #[error("request {0} has not been assigned to a node")]
    NotAssigned(String),

    #[error("all hardware variants exhausted for {workload_type} (tried {tried:?})")]
    AllVariantsExhausted {
        workload_type: String,
        tried: Vec<String>,
    },

    #[error("storage volume not found: {0}")]
    StorageNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("unknown workload type: {0}")]
    UnknownWorkloadType(String),

    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error("state error: {0}")]
    State(StateError),
}

impl SchedulerError {
    pub(crate) fn provider(op: &'static str, source: ProviderError) -> Self {
        SchedulerError::ProviderCallFailed { op, source }
    }
}

impl From<StateError> for SchedulerError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::UnknownRequest(id) => SchedulerError::UnknownRequest(id),
            StateError::AlreadyTerminal { id, status } => {
                SchedulerError::AlreadyTerminal { id, status }
            }
            StateError::NotAssigned(id) => SchedulerError::NotAssigned(id),
            StateError::NodeNotFound(id) => SchedulerError::NodeNotFound(id),
            other => SchedulerError::State(other),
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use podgrid_state::NodeStatus;

    #[test]
    fn state_errors_map_to_lifecycle_kinds() {
        let err: SchedulerError = StateError::UnknownRequest("r-1".into()).into();
        assert!(matches!(err, SchedulerError::UnknownRequest(id) if id == "r-1"));

        let err: SchedulerError = StateError::AlreadyTerminal {
            id: "r-2".into(),
            status: RequestStatus::Completed,
        }
        .into();
        assert_eq!(err.to_string(), "request r-2 is already completed");

        let err: SchedulerError = StateError::InvalidTransition {
            id: "pod-1".into(),
            from: NodeStatus::Terminated,
            to: NodeStatus::Running,
        }
        .into();
        assert!(matches!(err, SchedulerError::State(_)));
    }
}
