//! Error types for the podgrid registry.

use thiserror::Error;

use crate::types::{NodeStatus, RequestStatus};

/// Result type alias for registry operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while mutating the registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("unknown request: {0}")]
    UnknownRequest(String),

    #[error("request {id} already finished as {status}")]
    AlreadyTerminal { id: String, status: RequestStatus },

    #[error("request {0} has not been assigned to a node")]
    NotAssigned(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: NodeStatus,
        to: NodeStatus,
    },
}
