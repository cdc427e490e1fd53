//! Domain types for workload requests and pool nodes.
//!
//! Wall-clock fields (`*_at` on requests) are unix seconds for display.
//! Node deadlines use `tokio::time::Instant` so the scheduler's timing
//! follows the runtime clock.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Unique identifier for a submitted workload request.
pub type RequestId = String;

/// Identifier assigned by the compute provider when a node is created.
pub type NodeId = String;

// ── Requests ──────────────────────────────────────────────────────

/// Lifecycle status of a workload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::Processing => write!(f, "processing"),
            RequestStatus::Completed => write!(f, "completed"),
            RequestStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One unit of submitted work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadRequest {
    pub id: RequestId,
    pub workload_type: String,
    /// Opaque payload handed to the executor that runs the work.
    pub payload: serde_json::Value,
    pub status: RequestStatus,
    pub assigned_node_id: Option<NodeId>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub submitted_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
}

impl WorkloadRequest {
    pub fn new(workload_type: &str, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workload_type: workload_type.to_string(),
            payload,
            status: RequestStatus::Pending,
            assigned_node_id: None,
            result: None,
            error: None,
            submitted_at: epoch_secs(),
            started_at: None,
            completed_at: None,
        }
    }
}

// ── Nodes ─────────────────────────────────────────────────────────

/// Lifecycle status of a pool node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Provisioning,
    Running,
    Paused,
    Terminated,
    Failed,
}

impl NodeStatus {
    /// Allowed node transitions: provisioning → running → paused →
    /// terminated, paused → running on resume, and anything → failed or
    /// terminated.
    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Failed) | (_, Terminated) => true,
            (Provisioning, Running) => true,
            (Running, Paused) => true,
            (Paused, Running) => true,
            _ => false,
        }
    }

    /// Whether requests may be placed on a node in this status.
    pub fn accepts_work(self) -> bool {
        matches!(self, NodeStatus::Running | NodeStatus::Paused)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Provisioning => write!(f, "provisioning"),
            NodeStatus::Running => write!(f, "running"),
            NodeStatus::Paused => write!(f, "paused"),
            NodeStatus::Terminated => write!(f, "terminated"),
            NodeStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Pool limits copied onto a node when it is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLimits {
    /// Max concurrent requests.
    pub capacity: u32,
    pub pause_timeout: Duration,
    pub terminate_timeout: Duration,
}

/// A leased remote compute node running one workload type's service.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub workload_type: String,
    /// Hardware variant the node was created on.
    pub hardware: String,
    pub status: NodeStatus,
    pub limits: NodeLimits,
    /// Requests currently processing on this node, in assignment order.
    pub assigned_requests: Vec<RequestId>,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub pause_deadline: Instant,
    pub terminate_deadline: Instant,
    pub paused_at: Option<Instant>,
    /// Unix seconds, for display.
    pub created_epoch: u64,
}

impl Node {
    pub fn new(
        id: &str,
        workload_type: &str,
        hardware: &str,
        limits: NodeLimits,
        now: Instant,
    ) -> Self {
        let mut node = Self {
            id: id.to_string(),
            workload_type: workload_type.to_string(),
            hardware: hardware.to_string(),
            status: NodeStatus::Provisioning,
            limits,
            assigned_requests: Vec::new(),
            created_at: now,
            last_used_at: now,
            pause_deadline: now,
            terminate_deadline: now,
            paused_at: None,
            created_epoch: epoch_secs(),
        };
        node.touch(now);
        node
    }

    pub fn assigned_count(&self) -> usize {
        self.assigned_requests.len()
    }

    /// Remaining request slots.
    pub fn free_slots(&self) -> usize {
        (self.limits.capacity as usize).saturating_sub(self.assigned_requests.len())
    }

    /// Mark the node used at `now` and push both deadlines out.
    pub fn touch(&mut self, now: Instant) {
        self.last_used_at = now;
        self.pause_deadline = deadline_after(now, self.limits.pause_timeout);
        self.terminate_deadline =
            deadline_after(self.pause_deadline, self.limits.terminate_timeout);
    }

    /// Running, idle and past its pause deadline.
    pub fn is_due_for_pause(&self, now: Instant) -> bool {
        self.status == NodeStatus::Running
            && self.assigned_requests.is_empty()
            && now >= self.pause_deadline
    }

    /// Paused and past its terminate deadline.
    pub fn is_due_for_termination(&self, now: Instant) -> bool {
        self.status == NodeStatus::Paused
            && self.assigned_requests.is_empty()
            && now >= self.terminate_deadline
    }

    pub fn snapshot(&self, now: Instant) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id.clone(),
            workload_type: self.workload_type.clone(),
            hardware: self.hardware.clone(),
            status: self.status,
            capacity: self.limits.capacity,
            assigned_requests: self.assigned_requests.clone(),
            created_at: self.created_epoch,
            idle_secs: now.saturating_duration_since(self.last_used_at).as_secs(),
            pause_in_secs: (self.status == NodeStatus::Running)
                .then(|| self.pause_deadline.saturating_duration_since(now).as_secs()),
            terminate_in_secs: (self.status == NodeStatus::Paused)
                .then(|| self.terminate_deadline.saturating_duration_since(now).as_secs()),
        }
    }
}

/// Serializable view of a node for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub workload_type: String,
    pub hardware: String,
    pub status: NodeStatus,
    pub capacity: u32,
    pub assigned_requests: Vec<RequestId>,
    pub created_at: u64,
    pub idle_secs: u64,
    pub pause_in_secs: Option<u64>,
    pub terminate_in_secs: Option<u64>,
}

/// Current unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Upper bound used when a deadline would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// `from + after`, saturating to a far-future instant instead of panicking
/// on overflow.
pub fn deadline_after(from: Instant, after: Duration) -> Instant {
    from.checked_add(after)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}
