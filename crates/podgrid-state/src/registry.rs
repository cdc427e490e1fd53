//! In-memory node pool registry and per-type workload queue.
//!
//! The registry is plain data: every method runs synchronously against
//! `&mut self`, and the scheduler wraps one instance in a single lock so
//! each check-then-act sequence is atomic.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::types::*;

/// Bounds on how many finished requests are kept for lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_terminal: usize,
    pub ttl: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_terminal: 1000,
            ttl: Duration::from_secs(3600),
        }
    }
}

struct RequestEntry {
    request: WorkloadRequest,
    /// Set when the request reaches a terminal status.
    finished_at: Option<Instant>,
}

/// Point-in-time view of nodes and queued work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrySnapshot {
    pub nodes: Vec<NodeSnapshot>,
    pub pending_by_type: BTreeMap<String, Vec<WorkloadRequest>>,
}

/// Node table, pending queues and request records.
pub struct Registry {
    /// Nodes in registration order.
    nodes: Vec<Node>,
    requests: HashMap<RequestId, RequestEntry>,
    /// Pending request ids per workload type, oldest first.
    pending: BTreeMap<String, VecDeque<RequestId>>,
    /// Workload types with a provisioning sequence in flight.
    provisioning: BTreeSet<String>,
    retention: RetentionPolicy,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

impl Registry {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            nodes: Vec::new(),
            requests: HashMap::new(),
            pending: BTreeMap::new(),
            provisioning: BTreeSet::new(),
            retention,
        }
    }

    // ── Queue ────────────────────────────────────────────────────

    /// Create a pending request and append it to its type's queue.
    pub fn enqueue(&mut self, workload_type: &str, payload: serde_json::Value) -> RequestId {
        let request = WorkloadRequest::new(workload_type, payload);
        let id = request.id.clone();
        self.pending
            .entry(workload_type.to_string())
            .or_default()
            .push_back(id.clone());
        self.requests.insert(
            id.clone(),
            RequestEntry {
                request,
                finished_at: None,
            },
        );
        debug!(request_id = %id, %workload_type, "request enqueued");
        id
    }

    /// Workload types that have at least one pending request.
    pub fn pending_types(&self) -> Vec<String> {
        self.pending
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(t, _)| t.clone())
            .collect()
    }

    pub fn pending_count(&self, workload_type: &str) -> usize {
        self.pending.get(workload_type).map_or(0, VecDeque::len)
    }

    // ── Nodes ────────────────────────────────────────────────────

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    fn node_mut(&mut self, node_id: &str) -> StateResult<&mut Node> {
        self.nodes
            .iter_mut()
            .find(|n| n.id == node_id)
            .ok_or_else(|| StateError::NodeNotFound(node_id.to_string()))
    }

    /// First node of the type that is running or paused and below capacity.
    pub fn find_available_node(&self, workload_type: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| {
            n.workload_type == workload_type && n.status.accepts_work() && n.free_slots() > 0
        })
    }

    /// Claim the provisioning slot for a workload type.
    ///
    /// Returns false if a sequence is already in flight for that type.
    pub fn begin_provisioning(&mut self, workload_type: &str) -> bool {
        self.provisioning.insert(workload_type.to_string())
    }

    pub fn finish_provisioning(&mut self, workload_type: &str) {
        self.provisioning.remove(workload_type);
    }

    pub fn is_provisioning(&self, workload_type: &str) -> bool {
        self.provisioning.contains(workload_type)
            || self.nodes.iter().any(|n| {
                n.workload_type == workload_type && n.status == NodeStatus::Provisioning
            })
    }

    /// Track a node that the provider has just created.
    pub fn insert_node(&mut self, node: Node) {
        info!(
            node_id = %node.id,
            workload_type = %node.workload_type,
            hardware = %node.hardware,
            status = %node.status,
            "node registered"
        );
        self.nodes.push(node);
    }

    /// Move a node to a new status, applying the deadline side effects.
    ///
    /// Running refreshes both deadlines. Paused starts the terminate
    /// countdown from `now`.
    pub fn set_node_status(
        &mut self,
        node_id: &str,
        status: NodeStatus,
        now: Instant,
    ) -> StateResult<NodeStatus> {
        let node = self.node_mut(node_id)?;
        let from = node.status;
        if from == status {
            return Ok(from);
        }
        if !from.can_transition_to(status) {
            return Err(StateError::InvalidTransition {
                id: node_id.to_string(),
                from,
                to: status,
            });
        }

        node.status = status;
        match status {
            NodeStatus::Running => {
                node.paused_at = None;
                node.touch(now);
            }
            NodeStatus::Paused => {
                node.paused_at = Some(now);
                node.terminate_deadline = deadline_after(now, node.limits.terminate_timeout);
            }
            NodeStatus::Provisioning | NodeStatus::Terminated | NodeStatus::Failed => {}
        }

        info!(%node_id, %from, to = %status, "node status changed");
        Ok(from)
    }

    /// Drop a node from the registry.
    ///
    /// Finished requests it processed are purged with it; requests still
    /// processing on it are failed so callers can observe the loss.
    pub fn remove_node(&mut self, node_id: &str, now: Instant) -> Option<Node> {
        let idx = self.nodes.iter().position(|n| n.id == node_id)?;
        let node = self.nodes.remove(idx);

        self.requests.retain(|_, entry| {
            !(entry.request.status.is_terminal()
                && entry.request.assigned_node_id.as_deref() == Some(node_id))
        });

        for request_id in &node.assigned_requests {
            if let Some(entry) = self.requests.get_mut(request_id) {
                warn!(%request_id, %node_id, "request lost with removed node");
                entry.request.status = RequestStatus::Failed;
                entry.request.error = Some(format!(
                    "node {node_id} was removed before the request finished"
                ));
                entry.request.completed_at = Some(epoch_secs());
                entry.finished_at = Some(now);
            }
        }

        info!(%node_id, "node removed from registry");
        Some(node)
    }

    pub fn nodes_due_for_pause(&self, now: Instant) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.is_due_for_pause(now))
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn nodes_due_for_termination(&self, now: Instant) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.is_due_for_termination(now))
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn failed_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Failed)
            .map(|n| n.id.clone())
            .collect()
    }

    // ── Assignment ───────────────────────────────────────────────

    /// Move pending requests of the node's type onto the node, up to its
    /// free capacity. Returns the moved ids in queue order.
    pub fn assign_pending(&mut self, node_id: &str, now: Instant) -> StateResult<Vec<RequestId>> {
        let node = self
            .nodes
            .iter_mut()
            .find(|n| n.id == node_id)
            .ok_or_else(|| StateError::NodeNotFound(node_id.to_string()))?;
        if !node.status.accepts_work() {
            return Ok(Vec::new());
        }

        let Some(queue) = self.pending.get_mut(&node.workload_type) else {
            return Ok(Vec::new());
        };

        let take = node.free_slots().min(queue.len());
        let started = epoch_secs();
        let mut moved = Vec::with_capacity(take);
        for request_id in queue.drain(..take) {
            if let Some(entry) = self.requests.get_mut(&request_id) {
                entry.request.status = RequestStatus::Processing;
                entry.request.assigned_node_id = Some(node.id.clone());
                entry.request.started_at = Some(started);
            }
            node.assigned_requests.push(request_id.clone());
            moved.push(request_id);
        }

        if !moved.is_empty() {
            node.touch(now);
            debug!(
                %node_id,
                count = moved.len(),
                assigned = node.assigned_count(),
                "requests assigned"
            );
        }
        debug_assert!(node.assigned_count() <= node.limits.capacity as usize);
        Ok(moved)
    }

    /// Undo an assignment that never reached the node: requests go back to
    /// the front of their queue in their original order.
    pub fn rollback_assignment(&mut self, node_id: &str, request_ids: &[RequestId]) -> usize {
        let mut restored = 0;
        for request_id in request_ids.iter().rev() {
            let Some(entry) = self.requests.get_mut(request_id) else {
                continue;
            };
            if entry.request.status != RequestStatus::Processing
                || entry.request.assigned_node_id.as_deref() != Some(node_id)
            {
                continue;
            }
            entry.request.status = RequestStatus::Pending;
            entry.request.assigned_node_id = None;
            entry.request.started_at = None;
            self.pending
                .entry(entry.request.workload_type.clone())
                .or_default()
                .push_front(request_id.clone());
            restored += 1;
        }

        if let Some(node) = self.nodes.iter_mut().find(|n| n.id == node_id) {
            node.assigned_requests.retain(|id| !request_ids.contains(id));
        }

        if restored > 0 {
            warn!(%node_id, restored, "assignment rolled back to pending");
        }
        restored
    }

    // ── Lifecycle ────────────────────────────────────────────────

    pub fn get_request(&self, request_id: &str) -> Option<&WorkloadRequest> {
        self.requests.get(request_id).map(|e| &e.request)
    }

    /// Record a successful result for a processing request.
    pub fn complete(
        &mut self,
        request_id: &str,
        result: serde_json::Value,
        now: Instant,
    ) -> StateResult<WorkloadRequest> {
        self.finish(request_id, RequestStatus::Completed, Some(result), None, now)
    }

    /// Record a failure for a processing request.
    pub fn fail(
        &mut self,
        request_id: &str,
        error: &str,
        now: Instant,
    ) -> StateResult<WorkloadRequest> {
        self.finish(
            request_id,
            RequestStatus::Failed,
            None,
            Some(error.to_string()),
            now,
        )
    }

    fn finish(
        &mut self,
        request_id: &str,
        status: RequestStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
        now: Instant,
    ) -> StateResult<WorkloadRequest> {
        let entry = self
            .requests
            .get_mut(request_id)
            .ok_or_else(|| StateError::UnknownRequest(request_id.to_string()))?;

        match entry.request.status {
            RequestStatus::Processing => {}
            RequestStatus::Pending => {
                return Err(StateError::NotAssigned(request_id.to_string()));
            }
            done @ (RequestStatus::Completed | RequestStatus::Failed) => {
                return Err(StateError::AlreadyTerminal {
                    id: request_id.to_string(),
                    status: done,
                });
            }
        }

        entry.request.status = status;
        entry.request.result = result;
        entry.request.error = error;
        entry.request.completed_at = Some(epoch_secs());
        entry.finished_at = Some(now);

        if let Some(node_id) = entry.request.assigned_node_id.clone()
            && let Some(node) = self.nodes.iter_mut().find(|n| n.id == node_id)
        {
            node.assigned_requests.retain(|id| id != request_id);
            node.touch(now);
        }

        info!(%request_id, %status, "request finished");
        Ok(entry.request.clone())
    }

    /// Evict finished requests past the TTL, then the oldest beyond the
    /// count limit. Returns how many were evicted.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let ttl = self.retention.ttl;
        let before = self.requests.len();
        self.requests.retain(|_, entry| match entry.finished_at {
            Some(at) => now.saturating_duration_since(at) < ttl,
            None => true,
        });

        let mut finished: Vec<(Instant, RequestId)> = self
            .requests
            .iter()
            .filter_map(|(id, e)| e.finished_at.map(|at| (at, id.clone())))
            .collect();
        if finished.len() > self.retention.max_terminal {
            finished.sort();
            let excess = finished.len() - self.retention.max_terminal;
            for (_, id) in finished.into_iter().take(excess) {
                self.requests.remove(&id);
            }
        }

        let purged = before - self.requests.len();
        if purged > 0 {
            debug!(purged, "finished requests evicted");
        }
        purged
    }

    // ── Observability ────────────────────────────────────────────

    pub fn snapshot(&self, now: Instant) -> RegistrySnapshot {
        let nodes = self.nodes.iter().map(|n| n.snapshot(now)).collect();
        let pending_by_type = self
            .pending
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(workload_type, queue)| {
                let requests = queue
                    .iter()
                    .filter_map(|id| self.requests.get(id))
                    .map(|e| e.request.clone())
                    .collect();
                (workload_type.clone(), requests)
            })
            .collect();
        RegistrySnapshot {
            nodes,
            pending_by_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn limits(capacity: u32) -> NodeLimits {
        NodeLimits {
            capacity,
            pause_timeout: Duration::from_secs(60),
            terminate_timeout: Duration::from_secs(300),
        }
    }

    fn running_node(reg: &mut Registry, id: &str, workload_type: &str, capacity: u32) {
        let now = Instant::now();
        reg.insert_node(Node::new(id, workload_type, "A40", limits(capacity), now));
        reg.set_node_status(id, NodeStatus::Running, now).unwrap();
    }

    #[tokio::test]
    async fn enqueue_tracks_pending_per_type() {
        let mut reg = Registry::default();
        reg.enqueue("render", json!({}));
        reg.enqueue("render", json!({}));
        reg.enqueue("music", json!({}));

        assert_eq!(reg.pending_count("render"), 2);
        assert_eq!(reg.pending_count("music"), 1);
        assert_eq!(reg.pending_count("video"), 0);
        assert_eq!(reg.pending_types(), vec!["music", "render"]);
    }

    #[tokio::test]
    async fn assignment_is_bounded_by_capacity() {
        let mut reg = Registry::default();
        let ids: Vec<_> = (0..4).map(|i| reg.enqueue("render", json!({ "n": i }))).collect();
        running_node(&mut reg, "n1", "render", 3);

        let moved = reg.assign_pending("n1", Instant::now()).unwrap();
        assert_eq!(moved, ids[..3].to_vec());
        assert_eq!(reg.node("n1").unwrap().assigned_count(), 3);
        assert_eq!(reg.pending_count("render"), 1);

        // Node is full; nothing more moves.
        assert!(reg.assign_pending("n1", Instant::now()).unwrap().is_empty());
        assert!(reg.find_available_node("render").is_none());

        let req = reg.get_request(&ids[0]).unwrap();
        assert_eq!(req.status, RequestStatus::Processing);
        assert_eq!(req.assigned_node_id.as_deref(), Some("n1"));
        assert!(req.started_at.is_some());
    }

    #[tokio::test]
    async fn available_node_skips_other_types_and_provisioning() {
        let mut reg = Registry::default();
        running_node(&mut reg, "m1", "music", 2);
        reg.insert_node(Node::new("r0", "render", "A40", limits(2), Instant::now()));
        assert!(reg.find_available_node("render").is_none());
        assert!(reg.is_provisioning("render"));

        running_node(&mut reg, "r1", "render", 2);
        assert_eq!(reg.find_available_node("render").unwrap().id, "r1");
    }

    #[tokio::test]
    async fn paused_node_is_available() {
        let mut reg = Registry::default();
        running_node(&mut reg, "n1", "render", 1);
        reg.set_node_status("n1", NodeStatus::Paused, Instant::now())
            .unwrap();
        assert_eq!(reg.find_available_node("render").unwrap().id, "n1");
    }

    #[tokio::test]
    async fn provisioning_guard_is_exclusive() {
        let mut reg = Registry::default();
        assert!(reg.begin_provisioning("render"));
        assert!(!reg.begin_provisioning("render"));
        assert!(reg.is_provisioning("render"));
        reg.finish_provisioning("render");
        assert!(!reg.is_provisioning("render"));
        assert!(reg.begin_provisioning("render"));
    }

    #[tokio::test]
    async fn complete_frees_capacity_and_rejects_repeat() {
        let mut reg = Registry::default();
        let id = reg.enqueue("render", json!({}));
        running_node(&mut reg, "n1", "render", 1);
        reg.assign_pending("n1", Instant::now()).unwrap();

        let done = reg.complete(&id, json!({"url": "s3://out"}), Instant::now()).unwrap();
        assert_eq!(done.status, RequestStatus::Completed);
        assert_eq!(done.result, Some(json!({"url": "s3://out"})));
        assert!(done.completed_at.is_some());
        assert_eq!(reg.node("n1").unwrap().assigned_count(), 0);

        let again = reg.complete(&id, json!({}), Instant::now());
        assert_eq!(
            again,
            Err(StateError::AlreadyTerminal {
                id: id.clone(),
                status: RequestStatus::Completed
            })
        );
        let again = reg.fail(&id, "late", Instant::now());
        assert!(matches!(again, Err(StateError::AlreadyTerminal { .. })));
    }

    #[tokio::test]
    async fn fail_records_error() {
        let mut reg = Registry::default();
        let id = reg.enqueue("render", json!({}));
        running_node(&mut reg, "n1", "render", 1);
        reg.assign_pending("n1", Instant::now()).unwrap();

        let failed = reg.fail(&id, "out of memory", Instant::now()).unwrap();
        assert_eq!(failed.status, RequestStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("out of memory"));
        assert!(failed.result.is_none());
    }

    #[tokio::test]
    async fn unknown_and_pending_requests_are_rejected() {
        let mut reg = Registry::default();
        assert_eq!(
            reg.complete("nope", json!({}), Instant::now()),
            Err(StateError::UnknownRequest("nope".to_string()))
        );

        let id = reg.enqueue("render", json!({}));
        assert_eq!(
            reg.fail(&id, "boom", Instant::now()),
            Err(StateError::NotAssigned(id.clone()))
        );
        assert_eq!(reg.get_request(&id).unwrap().status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn rollback_restores_queue_order() {
        let mut reg = Registry::default();
        let ids: Vec<_> = (0..3).map(|_| reg.enqueue("render", json!({}))).collect();
        running_node(&mut reg, "n1", "render", 2);
        let moved = reg.assign_pending("n1", Instant::now()).unwrap();

        assert_eq!(reg.rollback_assignment("n1", &moved), 2);
        assert_eq!(reg.pending_count("render"), 3);
        assert_eq!(reg.node("n1").unwrap().assigned_count(), 0);

        let snapshot = reg.snapshot(Instant::now());
        let order: Vec<_> = snapshot.pending_by_type["render"]
            .iter()
            .map(|r| r.id.clone())
            .collect();
        assert_eq!(order, ids);
        assert!(snapshot.pending_by_type["render"]
            .iter()
            .all(|r| r.status == RequestStatus::Pending && r.assigned_node_id.is_none()));
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let mut reg = Registry::default();
        reg.insert_node(Node::new("n1", "render", "A40", limits(1), Instant::now()));
        let err = reg
            .set_node_status("n1", NodeStatus::Paused, Instant::now())
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
        assert!(matches!(
            reg.set_node_status("ghost", NodeStatus::Running, Instant::now()),
            Err(StateError::NodeNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_candidates_follow_deadlines() {
        let mut reg = Registry::default();
        running_node(&mut reg, "n1", "render", 1);
        let start = Instant::now();

        assert!(reg.nodes_due_for_pause(start).is_empty());
        let later = start + Duration::from_secs(61);
        assert_eq!(reg.nodes_due_for_pause(later), vec!["n1"]);

        reg.set_node_status("n1", NodeStatus::Paused, later).unwrap();
        assert!(reg.nodes_due_for_pause(later).is_empty());
        assert!(reg.nodes_due_for_termination(later).is_empty());
        assert_eq!(
            reg.nodes_due_for_termination(later + Duration::from_secs(300)),
            vec!["n1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pausing_with_unbounded_terminate_timeout_keeps_node() {
        let mut reg = Registry::default();
        let now = Instant::now();
        let limits = NodeLimits {
            capacity: 1,
            pause_timeout: Duration::from_secs(60),
            terminate_timeout: Duration::MAX,
        };
        reg.insert_node(Node::new("n1", "render", "A40", limits, now));
        reg.set_node_status("n1", NodeStatus::Running, now).unwrap();
        reg.set_node_status("n1", NodeStatus::Paused, now).unwrap();

        assert!(
            reg.nodes_due_for_termination(now + Duration::from_secs(86_400))
                .is_empty()
        );
    }

    #[tokio::test]
    async fn remove_node_purges_finished_and_fails_active() {
        let mut reg = Registry::default();
        let done = reg.enqueue("render", json!({}));
        let active = reg.enqueue("render", json!({}));
        running_node(&mut reg, "n1", "render", 2);
        reg.assign_pending("n1", Instant::now()).unwrap();
        reg.complete(&done, json!({}), Instant::now()).unwrap();

        let removed = reg.remove_node("n1", Instant::now()).unwrap();
        assert_eq!(removed.id, "n1");
        assert!(reg.node("n1").is_none());
        assert!(reg.get_request(&done).is_none());

        let lost = reg.get_request(&active).unwrap();
        assert_eq!(lost.status, RequestStatus::Failed);
        assert!(lost.error.as_deref().unwrap().contains("n1"));
        assert!(reg.remove_node("n1", Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retention_evicts_by_ttl_and_count() {
        let mut reg = Registry::new(RetentionPolicy {
            max_terminal: 2,
            ttl: Duration::from_secs(100),
        });
        let ids: Vec<_> = (0..3).map(|_| reg.enqueue("render", json!({}))).collect();
        let queued = reg.enqueue("render", json!({}));
        running_node(&mut reg, "n1", "render", 3);
        reg.assign_pending("n1", Instant::now()).unwrap();

        for id in &ids {
            reg.complete(id, json!({}), Instant::now()).unwrap();
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        // Count limit keeps the two newest.
        assert_eq!(reg.purge_expired(Instant::now()), 1);
        assert!(reg.get_request(&ids[0]).is_none());
        assert!(reg.get_request(&ids[2]).is_some());

        // TTL drops the rest but never touches unfinished requests.
        tokio::time::advance(Duration::from_secs(200)).await;
        assert_eq!(reg.purge_expired(Instant::now()), 2);
        assert!(reg.get_request(&queued).is_some());
    }

    #[tokio::test]
    async fn snapshot_lists_nodes_and_pending() {
        let mut reg = Registry::default();
        reg.enqueue("render", json!({"a": 1}));
        running_node(&mut reg, "n1", "music", 2);

        let snapshot = reg.snapshot(Instant::now());
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.nodes[0].status, NodeStatus::Running);
        assert!(snapshot.nodes[0].pause_in_secs.is_some());
        assert_eq!(snapshot.pending_by_type["render"].len(), 1);
        assert!(!snapshot.pending_by_type.contains_key("music"));
    }
}
