//! Node provisioner — hardware-variant fallback.
//!
//! Tries each hardware variant of a workload type in priority order. A
//! variant that the provider rejects, or whose node never becomes ready,
//! is torn down before the next one is tried, so a failed sequence leaves
//! nothing behind at the provider or in the registry.

use std::sync::Arc;
use std::time::Duration;

use podgrid_core::WorkloadTypeConfig;
use podgrid_health::{ReadinessError, ReadinessProber};
use podgrid_provider::{ComputeProvider, CreateNodeRequest, bounded};
use podgrid_state::{Node, NodeId, NodeLimits, NodeStatus, Registry, epoch_secs};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};

/// Creates nodes and waits for them to become usable.
pub struct Provisioner {
    provider: Arc<dyn ComputeProvider>,
    prober: ReadinessProber,
    /// Upper bound for each provider call.
    call_timeout: Duration,
}

impl Provisioner {
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        prober: ReadinessProber,
        call_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            prober,
            call_timeout,
        }
    }

    /// Provision one ready node for `workload_type`.
    ///
    /// The node is registered as `provisioning` as soon as the provider
    /// accepts it and moves to `running` once both readiness phases pass.
    pub async fn provision(
        &self,
        registry: &Mutex<Registry>,
        workload_type: &str,
        config: &WorkloadTypeConfig,
        shutdown: watch::Receiver<bool>,
    ) -> SchedulerResult<NodeId> {
        let storage_volume_id = self.resolve_storage(config.storage.as_deref()).await?;
        let limits = NodeLimits {
            capacity: config.capacity,
            pause_timeout: config.pause_timeout(),
            terminate_timeout: config.terminate_timeout(),
        };

        let mut tried = Vec::with_capacity(config.hardware.len());
        for hardware in &config.hardware {
            if *shutdown.borrow() {
                return Err(SchedulerError::Cancelled);
            }
            tried.push(hardware.clone());

            let request = CreateNodeRequest {
                name: format!("podgrid-{workload_type}-{}", epoch_secs()),
                image: config.image.clone(),
                hardware: hardware.clone(),
                disk_gb: config.disk_gb,
                ports: vec![config.service_port],
                storage_volume_id: storage_volume_id.clone(),
                env: config.env.clone(),
            };

            debug!(%workload_type, %hardware, "creating node");
            let created = match bounded(
                "create_node",
                self.call_timeout,
                self.provider.create_node(&request),
            )
            .await
            {
                Ok(created) => created,
                Err(e) => {
                    warn!(
                        %workload_type,
                        %hardware,
                        error = %e,
                        "create_node failed, trying next variant"
                    );
                    continue;
                }
            };

            let node_id = created.id;
            registry.lock().await.insert_node(Node::new(
                &node_id,
                workload_type,
                hardware,
                limits,
                Instant::now(),
            ));

            match self
                .prober
                .wait_ready(&node_id, config.service_port, shutdown.clone())
                .await
            {
                Ok(ready) => {
                    let promoted = registry.lock().await.set_node_status(
                        &node_id,
                        NodeStatus::Running,
                        Instant::now(),
                    );
                    if let Err(e) = promoted {
                        // Removed or failed while we were probing.
                        warn!(
                            %node_id,
                            error = %e,
                            "node left provisioning before it became ready"
                        );
                        self.teardown(registry, &node_id).await;
                        return Err(e.into());
                    }
                    info!(
                        %node_id,
                        %workload_type,
                        %hardware,
                        address = %ready.address,
                        port = ready.port,
                        "node ready"
                    );
                    return Ok(node_id);
                }
                Err(ReadinessError::Cancelled(_)) => {
                    self.teardown(registry, &node_id).await;
                    return Err(SchedulerError::Cancelled);
                }
                Err(e) => {
                    warn!(
                        %node_id,
                        %hardware,
                        error = %e,
                        "node failed readiness, trying next variant"
                    );
                    self.teardown(registry, &node_id).await;
                }
            }
        }

        Err(SchedulerError::AllVariantsExhausted {
            workload_type: workload_type.to_string(),
            tried,
        })
    }

    /// Map a configured storage reference (id or name) to a volume id.
    async fn resolve_storage(&self, reference: Option<&str>) -> SchedulerResult<Option<String>> {
        let Some(reference) = reference else {
            return Ok(None);
        };

        let volumes = bounded(
            "list_storage_volumes",
            self.call_timeout,
            self.provider.list_storage_volumes(),
        )
        .await
        .map_err(|e| SchedulerError::provider("list_storage_volumes", e))?;

        volumes
            .into_iter()
            .find(|v| v.id == reference || v.name == reference)
            .map(|v| Some(v.id))
            .ok_or_else(|| SchedulerError::StorageNotFound(reference.to_string()))
    }

    /// Release a partially provisioned node and forget it.
    async fn teardown(&self, registry: &Mutex<Registry>, node_id: &str) {
        if let Err(e) = bounded(
            "terminate_node",
            self.call_timeout,
            self.provider.terminate_node(node_id),
        )
        .await
        {
            warn!(%node_id, error = %e, "terminate during teardown failed");
        }
        registry.lock().await.remove_node(node_id, Instant::now());
        debug!(%node_id, "partial node torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use podgrid_health::{ProbeResult, ReadinessSettings, ServiceProbe};
    use podgrid_provider::{InMemoryProvider, ProviderCall, ProviderNodeStatus};

    struct FixedProbe(ProbeResult);

    #[async_trait]
    impl ServiceProbe for FixedProbe {
        async fn check(&self, _address: &str, _path: &str, _timeout: Duration) -> ProbeResult {
            self.0
        }
    }

    fn settings() -> ReadinessSettings {
        ReadinessSettings {
            infra_interval: Duration::from_secs(1),
            infra_attempts: 3,
            service_interval: Duration::from_secs(2),
            service_attempts: 2,
            health_path: "/health".to_string(),
            probe_timeout: Duration::from_secs(1),
            describe_timeout: Duration::from_secs(5),
        }
    }

    fn provisioner(provider: Arc<InMemoryProvider>, probe: ProbeResult) -> Provisioner {
        let prober =
            ReadinessProber::new(provider.clone(), Arc::new(FixedProbe(probe)), settings());
        Provisioner::new(provider, prober, Duration::from_secs(5))
    }

    fn config() -> WorkloadTypeConfig {
        WorkloadTypeConfig::new(2, "llm:latest", &["H100", "A100", "A40"])
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_next_variant() {
        let provider = Arc::new(
            InMemoryProvider::new()
                .reject_hardware("H100")
                .crash_on_boot("A100"),
        );
        let registry = Mutex::new(Registry::default());
        let (_tx, rx) = watch::channel(false);

        let node_id = provisioner(provider.clone(), ProbeResult::Ready)
            .provision(&registry, "llm", &config(), rx)
            .await
            .unwrap();

        assert_eq!(provider.create_attempts(), vec!["H100", "A100", "A40"]);
        assert_eq!(provider.live_nodes(), vec![node_id.clone()]);

        let registry = registry.lock().await;
        assert_eq!(registry.nodes().len(), 1);
        let node = registry.node(&node_id).unwrap();
        assert_eq!(node.status, NodeStatus::Running);
        assert_eq!(node.hardware, "A40");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_variants_leave_nothing_behind() {
        let provider = Arc::new(InMemoryProvider::new());
        let registry = Mutex::new(Registry::default());
        let (_tx, rx) = watch::channel(false);

        let err = provisioner(provider.clone(), ProbeResult::NotReady)
            .provision(&registry, "llm", &config(), rx)
            .await
            .unwrap_err();

        match err {
            SchedulerError::AllVariantsExhausted { tried, .. } => {
                assert_eq!(tried, vec!["H100", "A100", "A40"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(provider.live_nodes().is_empty());
        assert!(registry.lock().await.nodes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn storage_is_resolved_by_name() {
        let provider = Arc::new(InMemoryProvider::new().with_volume("vol-9", "models"));
        let registry = Mutex::new(Registry::default());
        let (_tx, rx) = watch::channel(false);
        let mut config = config();
        config.storage = Some("models".to_string());

        let node_id = provisioner(provider.clone(), ProbeResult::Alive)
            .provision(&registry, "llm", &config, rx)
            .await
            .unwrap();

        let request = provider.node_request(&node_id).unwrap();
        assert_eq!(request.storage_volume_id.as_deref(), Some("vol-9"));
        assert_eq!(request.ports, vec![8000]);
        assert_eq!(request.image, "llm:latest");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_storage_creates_no_node() {
        let provider = Arc::new(InMemoryProvider::new());
        let registry = Mutex::new(Registry::default());
        let (_tx, rx) = watch::channel(false);
        let mut config = config();
        config.storage = Some("missing".to_string());

        let err = provisioner(provider.clone(), ProbeResult::Ready)
            .provision(&registry, "llm", &config, rx)
            .await
            .unwrap_err();

        assert!(matches!(err, SchedulerError::StorageNotFound(name) if name == "missing"));
        assert_eq!(provider.calls(), vec![ProviderCall::ListStorage]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_tears_down_in_flight_node() {
        let provider = Arc::new(InMemoryProvider::new().boot_after(100));
        let registry = Arc::new(Mutex::new(Registry::default()));
        let (tx, rx) = watch::channel(false);
        let provisioner = provisioner(provider.clone(), ProbeResult::Ready);

        let task = {
            let registry = registry.clone();
            tokio::spawn(async move {
                provisioner
                    .provision(&registry, "llm", &config(), rx)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(
            registry.lock().await.nodes()[0].status,
            NodeStatus::Provisioning
        );
        tx.send(true).unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SchedulerError::Cancelled));
        assert!(registry.lock().await.nodes().is_empty());
        assert_eq!(
            provider.node_status("pod-1"),
            Some(ProviderNodeStatus::Terminated)
        );
    }
}
