//! Two-phase node readiness prober.
//!
//! ```text
//! Creating ──describe_node: running + port mapped──▶ InfraReady
//! InfraReady ──health probe: ready or alive──▶ ServiceReady
//! any phase ──attempts exhausted / provider terminal──▶ TimeoutFailed
//! ```
//!
//! Both phases poll on a fixed interval with a bounded attempt count and
//! stop early when the shutdown signal fires.

use std::sync::Arc;
use std::time::Duration;

use podgrid_core::ReadinessConfig;
use podgrid_provider::{ComputeProvider, NodeDescriptor, ProviderNodeStatus, bounded};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::checker::{ProbeResult, ServiceProbe};

/// Where a node is in its readiness sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessPhase {
    Creating,
    InfraReady,
    ServiceReady,
    TimeoutFailed,
}

impl std::fmt::Display for ReadinessPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadinessPhase::Creating => write!(f, "creating"),
            ReadinessPhase::InfraReady => write!(f, "infra_ready"),
            ReadinessPhase::ServiceReady => write!(f, "service_ready"),
            ReadinessPhase::TimeoutFailed => write!(f, "timeout_failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadinessError {
    #[error("node {node_id} not running with a mapped port after {attempts} checks")]
    InfraTimeout { node_id: String, attempts: u32 },

    #[error("node {node_id} service not healthy after {attempts} checks")]
    ServiceTimeout { node_id: String, attempts: u32 },

    #[error("node {node_id} entered terminal provider state {status:?}")]
    NodeTerminated {
        node_id: String,
        status: ProviderNodeStatus,
    },

    #[error("readiness wait for node {0} cancelled")]
    Cancelled(String),
}

impl ReadinessError {
    /// The phase the node had reached when the wait gave up.
    pub fn reached(&self) -> ReadinessPhase {
        match self {
            ReadinessError::ServiceTimeout { .. } => ReadinessPhase::InfraReady,
            _ => ReadinessPhase::Creating,
        }
    }
}

/// Polling parameters for both phases.
#[derive(Debug, Clone)]
pub struct ReadinessSettings {
    pub infra_interval: Duration,
    pub infra_attempts: u32,
    pub service_interval: Duration,
    pub service_attempts: u32,
    pub health_path: String,
    pub probe_timeout: Duration,
    /// Upper bound for each `describe_node` call.
    pub describe_timeout: Duration,
}

impl ReadinessSettings {
    pub fn from_config(config: &ReadinessConfig, provider_timeout: Duration) -> Self {
        Self {
            infra_interval: config.infra_interval(),
            infra_attempts: config.infra_attempts.max(1),
            service_interval: config.service_interval(),
            service_attempts: config.service_attempts.max(1),
            health_path: config.health_path.clone(),
            probe_timeout: config.probe_timeout(),
            describe_timeout: provider_timeout,
        }
    }
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self::from_config(&ReadinessConfig::default(), Duration::from_secs(30))
    }
}

/// A node that passed both readiness phases.
#[derive(Debug, Clone)]
pub struct ReadyNode {
    pub descriptor: NodeDescriptor,
    pub address: String,
    pub port: u16,
    pub probe: ProbeResult,
}

/// Waits for provider nodes to become usable.
pub struct ReadinessProber {
    provider: Arc<dyn ComputeProvider>,
    probe: Arc<dyn ServiceProbe>,
    settings: ReadinessSettings,
}

impl ReadinessProber {
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        probe: Arc<dyn ServiceProbe>,
        settings: ReadinessSettings,
    ) -> Self {
        Self {
            provider,
            probe,
            settings,
        }
    }

    pub fn settings(&self) -> &ReadinessSettings {
        &self.settings
    }

    /// Run both phases for `node_id`, whose service listens on
    /// `service_port` inside the node.
    pub async fn wait_ready(
        &self,
        node_id: &str,
        service_port: u16,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ReadyNode, ReadinessError> {
        let mut phase = ReadinessPhase::Creating;
        debug!(%node_id, %phase, "waiting for node readiness");

        let result = async {
            let descriptor = self.wait_infra(node_id, service_port, &mut shutdown).await?;
            advance(&mut phase, ReadinessPhase::InfraReady, node_id);

            let (address, port) = descriptor
                .endpoint(service_port)
                .ok_or_else(|| ReadinessError::InfraTimeout {
                    node_id: node_id.to_string(),
                    attempts: self.settings.infra_attempts,
                })?;

            let probe = self
                .wait_service(node_id, &address, port, &mut shutdown)
                .await?;
            advance(&mut phase, ReadinessPhase::ServiceReady, node_id);

            Ok(ReadyNode {
                descriptor,
                address,
                port,
                probe,
            })
        }
        .await;

        if let Err(e) = &result {
            if !matches!(e, ReadinessError::Cancelled(_)) {
                advance(&mut phase, ReadinessPhase::TimeoutFailed, node_id);
            }
            warn!(%node_id, error = %e, "node did not become ready");
        }
        result
    }

    async fn wait_infra(
        &self,
        node_id: &str,
        service_port: u16,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<NodeDescriptor, ReadinessError> {
        let attempts = self.settings.infra_attempts;
        for attempt in 1..=attempts {
            if *shutdown.borrow() {
                return Err(ReadinessError::Cancelled(node_id.to_string()));
            }

            match bounded(
                "describe_node",
                self.settings.describe_timeout,
                self.provider.describe_node(node_id),
            )
            .await
            {
                Ok(desc) if desc.status.is_terminal() => {
                    return Err(ReadinessError::NodeTerminated {
                        node_id: node_id.to_string(),
                        status: desc.status,
                    });
                }
                Ok(desc)
                    if desc.status == ProviderNodeStatus::Running
                        && desc.endpoint(service_port).is_some() =>
                {
                    return Ok(desc);
                }
                Ok(desc) => {
                    debug!(%node_id, attempt, status = ?desc.status, "node not running yet");
                }
                Err(e) => {
                    debug!(%node_id, attempt, error = %e, "describe_node failed");
                }
            }

            if attempt < attempts {
                sleep_or_cancel(self.settings.infra_interval, node_id, shutdown).await?;
            }
        }

        Err(ReadinessError::InfraTimeout {
            node_id: node_id.to_string(),
            attempts,
        })
    }

    async fn wait_service(
        &self,
        node_id: &str,
        address: &str,
        port: u16,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ProbeResult, ReadinessError> {
        let target = format!("{address}:{port}");
        let attempts = self.settings.service_attempts;
        for attempt in 1..=attempts {
            if *shutdown.borrow() {
                return Err(ReadinessError::Cancelled(node_id.to_string()));
            }

            let result = self
                .probe
                .check(&target, &self.settings.health_path, self.settings.probe_timeout)
                .await;
            if result.is_success() {
                if result == ProbeResult::Alive {
                    debug!(
                        %node_id,
                        "service answered without readiness payload, accepting liveness"
                    );
                }
                return Ok(result);
            }
            debug!(%node_id, attempt, ?result, "service not ready yet");

            if attempt < attempts {
                sleep_or_cancel(self.settings.service_interval, node_id, shutdown).await?;
            }
        }

        Err(ReadinessError::ServiceTimeout {
            node_id: node_id.to_string(),
            attempts,
        })
    }
}

fn advance(phase: &mut ReadinessPhase, next: ReadinessPhase, node_id: &str) {
    info!(%node_id, from = %phase, to = %next, "readiness phase");
    *phase = next;
}

async fn sleep_or_cancel(
    interval: Duration,
    node_id: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ReadinessError> {
    tokio::select! {
        _ = tokio::time::sleep(interval) => Ok(()),
        changed = shutdown.changed() => {
            // A dropped sender means the owner is gone.
            if changed.is_err() || *shutdown.borrow() {
                Err(ReadinessError::Cancelled(node_id.to_string()))
            } else {
                Ok(())
            }
        }
    }
}
