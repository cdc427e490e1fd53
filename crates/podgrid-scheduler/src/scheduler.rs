//! Scheduler — the pool control loop.
//!
//! The `Scheduler` owns one [`Registry`] behind a single lock and drives it
//! from a periodic tick:
//!
//! - For every workload type with pending work, find a node with free
//!   capacity or start provisioning one (one sequence per type at a time)
//! - Move pending requests onto the node, resuming it first if paused
//! - Sweep idle nodes toward pause and paused nodes toward termination
//! - Evict finished requests past the retention policy
//!
//! Provider and health-check I/O never runs under the registry lock: each
//! step snapshots under the lock, releases it for the call, then reacquires
//! it to apply the result. Ticks are serialized by a second lock, which the
//! submit nudge also takes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use podgrid_core::{PodgridConfig, SweepPolicy, WorkloadTypeConfig};
use podgrid_health::{HttpServiceProbe, ReadinessProber, ReadinessSettings, ServiceProbe};
use podgrid_provider::{ComputeProvider, ProviderNodeStatus, bounded};
use podgrid_state::{
    NodeId, NodeSnapshot, NodeStatus, Registry, RequestId, RetentionPolicy, WorkloadRequest,
};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::provisioner::Provisioner;
use crate::sweep::{SweepReport, Sweeper};

/// Runtime settings derived from [`PodgridConfig`].
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    /// Upper bound for any single provider call.
    pub provider_timeout: Duration,
    pub nudge_on_submit: bool,
    pub sweep_policy: SweepPolicy,
    pub readiness: ReadinessSettings,
    pub retention: RetentionPolicy,
}

impl SchedulerSettings {
    pub fn from_config(config: &PodgridConfig) -> Self {
        let provider_timeout = config.scheduler.provider_timeout();
        Self {
            tick_interval: config.scheduler.tick_interval(),
            provider_timeout,
            nudge_on_submit: config.scheduler.nudge_on_submit,
            sweep_policy: config.scheduler.sweep_policy,
            readiness: ReadinessSettings::from_config(&config.readiness, provider_timeout),
            retention: RetentionPolicy {
                max_terminal: config.retention.max_terminal_requests,
                ttl: config.retention.terminal_ttl(),
            },
        }
    }
}

/// Point-in-time scheduler view.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub nodes: Vec<NodeSnapshot>,
    pub pending_by_type: BTreeMap<String, Vec<WorkloadRequest>>,
}

/// Where to reach a node's workload service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeConnection {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub address: Option<String>,
    pub port: Option<u16>,
    /// True once the node is running and its service port is published.
    pub ready: bool,
}

/// What one tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    /// Requests moved from pending to processing.
    pub assigned: usize,
    pub provisioned: Vec<NodeId>,
    pub sweep: SweepReport,
    /// Finished requests evicted by retention.
    pub purged: usize,
}

impl TickReport {
    fn is_quiet(&self) -> bool {
        self.assigned == 0
            && self.provisioned.is_empty()
            && self.sweep.paused.is_empty()
            && self.sweep.terminated.is_empty()
            && self.purged == 0
    }
}

#[derive(Debug, Default)]
struct TypeOutcome {
    assigned: usize,
    provisioned: Option<NodeId>,
}

struct Inner {
    provider: Arc<dyn ComputeProvider>,
    provisioner: Provisioner,
    sweeper: Sweeper,
    workloads: BTreeMap<String, WorkloadTypeConfig>,
    settings: SchedulerSettings,
    registry: Mutex<Registry>,
    /// Held for the duration of a tick or nudge.
    tick_lock: Mutex<()>,
    /// `true` cancels the loop and any readiness wait in flight.
    shutdown: watch::Sender<bool>,
    loop_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a scheduler instance. Clones share the same state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Build a scheduler that probes node health over HTTP.
    pub fn new(config: &PodgridConfig, provider: Arc<dyn ComputeProvider>) -> Self {
        Self::with_probe(config, provider, Arc::new(HttpServiceProbe))
    }

    /// Build a scheduler with a custom service probe.
    pub fn with_probe(
        config: &PodgridConfig,
        provider: Arc<dyn ComputeProvider>,
        probe: Arc<dyn ServiceProbe>,
    ) -> Self {
        let settings = SchedulerSettings::from_config(config);
        let prober = ReadinessProber::new(provider.clone(), probe, settings.readiness.clone());
        let provisioner = Provisioner::new(provider.clone(), prober, settings.provider_timeout);
        let sweeper = Sweeper::new(
            provider.clone(),
            settings.sweep_policy,
            settings.provider_timeout,
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                provider,
                provisioner,
                sweeper,
                workloads: config.workloads.clone(),
                registry: Mutex::new(Registry::new(settings.retention)),
                settings,
                tick_lock: Mutex::new(()),
                shutdown,
                loop_task: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    pub fn workload_types(&self) -> impl Iterator<Item = &str> {
        self.inner.workloads.keys().map(String::as_str)
    }

    // ── Inbound operations ───────────────────────────────────────

    /// Queue a request and, if enabled, trigger a scheduling pass without
    /// waiting for the next tick.
    pub async fn submit_workload(
        &self,
        workload_type: &str,
        payload: serde_json::Value,
    ) -> SchedulerResult<RequestId> {
        if !self.inner.workloads.contains_key(workload_type) {
            return Err(SchedulerError::UnknownWorkloadType(workload_type.to_string()));
        }

        let request_id = self
            .inner
            .registry
            .lock()
            .await
            .enqueue(workload_type, payload);
        info!(%request_id, %workload_type, "workload submitted");

        if self.inner.settings.nudge_on_submit {
            self.nudge();
        }
        Ok(request_id)
    }

    pub async fn get_status(&self) -> SchedulerStatus {
        let snapshot = self.inner.registry.lock().await.snapshot(Instant::now());
        SchedulerStatus {
            running: self.is_running(),
            nodes: snapshot.nodes,
            pending_by_type: snapshot.pending_by_type,
        }
    }

    pub async fn get_request(&self, request_id: &str) -> SchedulerResult<WorkloadRequest> {
        self.inner
            .registry
            .lock()
            .await
            .get_request(request_id)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownRequest(request_id.to_string()))
    }

    /// Record a result. Succeeds once per request.
    pub async fn mark_completed(
        &self,
        request_id: &str,
        result: serde_json::Value,
    ) -> SchedulerResult<WorkloadRequest> {
        let request = self
            .inner
            .registry
            .lock()
            .await
            .complete(request_id, result, Instant::now())?;
        Ok(request)
    }

    /// Record a failure. Succeeds once per request.
    pub async fn mark_failed(
        &self,
        request_id: &str,
        error: &str,
    ) -> SchedulerResult<WorkloadRequest> {
        let request = self
            .inner
            .registry
            .lock()
            .await
            .fail(request_id, error, Instant::now())?;
        Ok(request)
    }

    /// Resolve a node's public service endpoint from the provider's view.
    pub async fn get_node_connection(&self, node_id: &str) -> SchedulerResult<NodeConnection> {
        let (status, workload_type) = {
            let registry = self.inner.registry.lock().await;
            let node = registry
                .node(node_id)
                .ok_or_else(|| SchedulerError::NodeNotFound(node_id.to_string()))?;
            (node.status, node.workload_type.clone())
        };
        let service_port = self
            .inner
            .workloads
            .get(&workload_type)
            .map(|w| w.service_port)
            .ok_or(SchedulerError::UnknownWorkloadType(workload_type))?;

        let descriptor = match bounded(
            "describe_node",
            self.inner.settings.provider_timeout,
            self.inner.provider.describe_node(node_id),
        )
        .await
        {
            Ok(descriptor) => descriptor,
            Err(e) if status == NodeStatus::Provisioning => {
                debug!(%node_id, error = %e, "describe failed while provisioning");
                return Ok(NodeConnection {
                    node_id: node_id.to_string(),
                    status,
                    address: None,
                    port: None,
                    ready: false,
                });
            }
            Err(e) => return Err(SchedulerError::provider("describe_node", e)),
        };

        let endpoint = descriptor.endpoint(service_port);
        let ready = status == NodeStatus::Running
            && descriptor.status == ProviderNodeStatus::Running
            && endpoint.is_some();
        let (address, port) = endpoint.unzip();
        Ok(NodeConnection {
            node_id: node_id.to_string(),
            status,
            address,
            port,
            ready,
        })
    }

    // ── Loop lifecycle ───────────────────────────────────────────

    pub fn is_running(&self) -> bool {
        self.loop_task()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Spawn the periodic tick loop. Calling it while running is a no-op.
    pub fn start(&self) {
        let mut task = self.loop_task();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("scheduler loop already running");
            return;
        }

        self.inner.shutdown.send_replace(false);
        let shutdown = self.inner.shutdown.subscribe();
        let scheduler = self.clone();
        *task = Some(tokio::spawn(async move {
            scheduler.run_loop(shutdown).await;
        }));
    }

    /// Stop the loop, cancel readiness waits and pause every running node
    /// (best effort). Nodes created by manual ticks or nudges are paused
    /// even if the loop was never started. Returns how many were paused.
    pub async fn stop(&self) -> usize {
        let handle = self.loop_task().take();
        self.inner.shutdown.send_replace(true);
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!(error = %e, "scheduler loop task failed");
                }
            }
            None => debug!("scheduler loop was not running"),
        }

        // Let an in-flight nudge wind down.
        let _tick = self.inner.tick_lock.lock().await;

        let running: Vec<NodeId> = self
            .inner
            .registry
            .lock()
            .await
            .nodes()
            .iter()
            .filter(|n| n.status == NodeStatus::Running)
            .map(|n| n.id.clone())
            .collect();

        let mut paused = 0;
        for node_id in running {
            match bounded(
                "stop_node",
                self.inner.settings.provider_timeout,
                self.inner.provider.stop_node(&node_id),
            )
            .await
            {
                Ok(()) => {
                    let mut registry = self.inner.registry.lock().await;
                    match registry.set_node_status(&node_id, NodeStatus::Paused, Instant::now()) {
                        Ok(_) => paused += 1,
                        Err(e) => warn!(%node_id, error = %e, "could not mark node paused"),
                    }
                }
                Err(e) => warn!(%node_id, error = %e, "pause on stop failed"),
            }
        }

        info!(paused, "scheduler stopped");
        paused
    }

    /// Terminate every tracked node and clear the registry. Meant for
    /// process shutdown; provider failures are logged and the node is
    /// dropped locally anyway. Returns how many nodes were released.
    pub async fn cleanup(&self) -> usize {
        self.inner.shutdown.send_replace(true);
        let _tick = self.inner.tick_lock.lock().await;

        let node_ids: Vec<NodeId> = self
            .inner
            .registry
            .lock()
            .await
            .nodes()
            .iter()
            .map(|n| n.id.clone())
            .collect();

        let released = node_ids.len();
        for node_id in node_ids {
            if let Err(e) = bounded(
                "terminate_node",
                self.inner.settings.provider_timeout,
                self.inner.provider.terminate_node(&node_id),
            )
            .await
            {
                warn!(%node_id, error = %e, "terminate during cleanup failed");
            }

            let mut registry = self.inner.registry.lock().await;
            let now = Instant::now();
            if let Err(e) = registry.set_node_status(&node_id, NodeStatus::Terminated, now) {
                debug!(%node_id, error = %e, "node already gone");
            }
            registry.remove_node(&node_id, now);
        }

        info!(released, "cleanup finished");
        released
    }

    // ── Tick ─────────────────────────────────────────────────────

    /// Run one scheduling pass, then the timeout sweep, then retention.
    pub async fn tick(&self) -> TickReport {
        let _tick = self.inner.tick_lock.lock().await;

        let (assigned, provisioned) = self.schedule_pending().await;
        let sweep = self.inner.sweeper.run(&self.inner.registry).await;
        let purged = self
            .inner
            .registry
            .lock()
            .await
            .purge_expired(Instant::now());

        TickReport {
            assigned,
            provisioned,
            sweep,
            purged,
        }
    }

    /// Run an assignment pass now instead of waiting for the next tick.
    /// The pass is serialized with ticks and skipped once shutdown began.
    fn nudge(&self) {
        if *self.inner.shutdown.borrow() {
            return;
        }

        let scheduler = self.clone();
        let pass = tokio::spawn(async move {
            let _tick = scheduler.inner.tick_lock.lock().await;
            if *scheduler.inner.shutdown.borrow() {
                return;
            }
            let (assigned, provisioned) = scheduler.schedule_pending().await;
            debug!(assigned, provisioned = provisioned.len(), "nudge finished");
        });
        tokio::spawn(async move {
            if let Err(e) = pass.await {
                error!(error = %e, "nudge task failed");
            }
        });
    }

    async fn run_loop(self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.inner.settings.tick_interval;
        info!(
            interval_ms = interval.as_millis() as u64,
            workload_types = self.inner.workloads.len(),
            "scheduler loop started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let report = self.tick().await;
                    if report.is_quiet() {
                        debug!("tick finished");
                    } else {
                        info!(
                            assigned = report.assigned,
                            provisioned = report.provisioned.len(),
                            paused = report.sweep.paused.len(),
                            terminated = report.sweep.terminated.len(),
                            purged = report.purged,
                            "tick finished"
                        );
                    }
                }
                _ = shutdown.changed() => {}
            }

            if *shutdown.borrow() {
                info!("scheduler loop shutting down");
                break;
            }
        }
    }

    /// Assignment pass over every workload type with pending work. Types
    /// run concurrently; each one writes through the registry lock.
    async fn schedule_pending(&self) -> (usize, Vec<NodeId>) {
        let types = self.inner.registry.lock().await.pending_types();

        let mut tasks = JoinSet::new();
        for workload_type in types {
            let scheduler = self.clone();
            tasks.spawn(async move {
                let outcome = scheduler.schedule_type(&workload_type).await;
                (workload_type, outcome)
            });
        }

        let mut assigned = 0;
        let mut provisioned = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => {
                    assigned += outcome.assigned;
                    provisioned.extend(outcome.provisioned);
                }
                Ok((workload_type, Err(SchedulerError::Cancelled))) => {
                    debug!(%workload_type, "scheduling cancelled by shutdown");
                }
                Ok((workload_type, Err(e))) => {
                    warn!(
                        %workload_type,
                        error = %e,
                        "scheduling pass failed, requests stay queued"
                    );
                }
                Err(e) => error!(error = %e, "scheduling task panicked"),
            }
        }
        (assigned, provisioned)
    }

    async fn schedule_type(&self, workload_type: &str) -> SchedulerResult<TypeOutcome> {
        let config = self
            .inner
            .workloads
            .get(workload_type)
            .ok_or_else(|| SchedulerError::UnknownWorkloadType(workload_type.to_string()))?;

        let available = {
            let mut registry = self.inner.registry.lock().await;
            if registry.pending_count(workload_type) == 0 {
                return Ok(TypeOutcome::default());
            }
            match registry.find_available_node(workload_type) {
                Some(node) => Some(node.id.clone()),
                None if registry.is_provisioning(workload_type) => {
                    debug!(%workload_type, "provisioning already in progress");
                    return Ok(TypeOutcome::default());
                }
                None => {
                    registry.begin_provisioning(workload_type);
                    None
                }
            }
        };

        let mut outcome = TypeOutcome::default();
        let node_id = match available {
            Some(node_id) => node_id,
            None => {
                info!(%workload_type, "no available node, provisioning");
                let guard = ProvisioningGuard::new(self.clone(), workload_type);
                let result = self
                    .inner
                    .provisioner
                    .provision(
                        &self.inner.registry,
                        workload_type,
                        config,
                        self.inner.shutdown.subscribe(),
                    )
                    .await;
                guard.release().await;
                let node_id = result?;
                outcome.provisioned = Some(node_id.clone());
                node_id
            }
        };

        outcome.assigned = self.assign(&node_id).await?;
        Ok(outcome)
    }

    /// Move pending work onto `node_id`, resuming the node if it was paused.
    /// A failed resume puts the work back in the queue and fails the node.
    async fn assign(&self, node_id: &str) -> SchedulerResult<usize> {
        let (moved, was_paused) = {
            let mut registry = self.inner.registry.lock().await;
            let was_paused = registry
                .node(node_id)
                .is_some_and(|n| n.status == NodeStatus::Paused);
            (registry.assign_pending(node_id, Instant::now())?, was_paused)
        };
        if moved.is_empty() || !was_paused {
            return Ok(moved.len());
        }

        let resumed = bounded(
            "start_node",
            self.inner.settings.provider_timeout,
            self.inner.provider.start_node(node_id),
        )
        .await;

        let mut registry = self.inner.registry.lock().await;
        let now = Instant::now();
        match resumed {
            Ok(()) => {
                registry.set_node_status(node_id, NodeStatus::Running, now)?;
                info!(%node_id, assigned = moved.len(), "paused node resumed");
                Ok(moved.len())
            }
            Err(e) => {
                registry.rollback_assignment(node_id, &moved);
                if let Err(state_err) = registry.set_node_status(node_id, NodeStatus::Failed, now) {
                    warn!(%node_id, error = %state_err, "could not mark node failed");
                }
                Err(SchedulerError::provider("start_node", e))
            }
        }
    }

    fn loop_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .loop_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// Clears a workload type's provisioning flag. Dropping it without
/// [`ProvisioningGuard::release`] (a panicking or aborted sequence) still
/// clears the flag, so the type can provision again on a later pass.
struct ProvisioningGuard {
    scheduler: Scheduler,
    workload_type: Option<String>,
}

impl ProvisioningGuard {
    fn new(scheduler: Scheduler, workload_type: &str) -> Self {
        Self {
            scheduler,
            workload_type: Some(workload_type.to_string()),
        }
    }

    async fn release(mut self) {
        if let Some(workload_type) = self.workload_type.take() {
            self.scheduler
                .inner
                .registry
                .lock()
                .await
                .finish_provisioning(&workload_type);
        }
    }
}

impl Drop for ProvisioningGuard {
    fn drop(&mut self) {
        let Some(workload_type) = self.workload_type.take() else {
            return;
        };
        warn!(%workload_type, "provisioning sequence ended abnormally");

        if let Ok(mut registry) = self.scheduler.inner.registry.try_lock() {
            registry.finish_provisioning(&workload_type);
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let scheduler = self.scheduler.clone();
            runtime.spawn(async move {
                scheduler
                    .inner
                    .registry
                    .lock()
                    .await
                    .finish_provisioning(&workload_type);
            });
        }
    }
}
