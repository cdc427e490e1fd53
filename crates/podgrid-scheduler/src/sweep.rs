//! Timeout sweep — idle nodes toward pause, paused nodes toward release.
//!
//! Runs at the end of every tick:
//!
//! 1. Running nodes with no assigned work past their pause deadline are
//!    stopped and marked `paused`.
//! 2. Paused nodes past their terminate deadline, and nodes marked
//!    `failed`, are terminated and removed from the registry.
//!
//! When the provider call fails, [`SweepPolicy`] decides whether the local
//! transition still happens.

use std::sync::Arc;
use std::time::Duration;

use podgrid_core::SweepPolicy;
use podgrid_provider::{ComputeProvider, bounded};
use podgrid_state::{NodeId, NodeStatus, Registry};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// Nodes moved by one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub paused: Vec<NodeId>,
    pub terminated: Vec<NodeId>,
    /// Provider calls that failed during this sweep.
    pub provider_failures: usize,
}

pub struct Sweeper {
    provider: Arc<dyn ComputeProvider>,
    policy: SweepPolicy,
    call_timeout: Duration,
}

impl Sweeper {
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        policy: SweepPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            policy,
            call_timeout,
        }
    }

    pub fn policy(&self) -> SweepPolicy {
        self.policy
    }

    pub async fn run(&self, registry: &Mutex<Registry>) -> SweepReport {
        let now = Instant::now();
        let (to_pause, to_release) = {
            let registry = registry.lock().await;
            let mut release = registry.nodes_due_for_termination(now);
            release.extend(registry.failed_nodes());
            (registry.nodes_due_for_pause(now), release)
        };

        let mut report = SweepReport::default();

        for node_id in to_pause {
            let call = bounded(
                "stop_node",
                self.call_timeout,
                self.provider.stop_node(&node_id),
            )
            .await;
            if let Err(e) = &call {
                report.provider_failures += 1;
                warn!(%node_id, error = %e, policy = ?self.policy, "pause call failed");
                if self.policy == SweepPolicy::Strict {
                    continue;
                }
            }

            let mut state = registry.lock().await;
            let now = Instant::now();
            // Work may have landed on the node while the call was in flight.
            if !state.node(&node_id).is_some_and(|n| n.is_due_for_pause(now)) {
                continue;
            }
            match state.set_node_status(&node_id, NodeStatus::Paused, now) {
                Ok(_) => {
                    info!(%node_id, "idle node paused");
                    report.paused.push(node_id);
                }
                Err(e) => warn!(%node_id, error = %e, "could not mark node paused"),
            }
        }

        for node_id in to_release {
            let call = bounded(
                "terminate_node",
                self.call_timeout,
                self.provider.terminate_node(&node_id),
            )
            .await;
            if let Err(e) = &call {
                report.provider_failures += 1;
                warn!(%node_id, error = %e, policy = ?self.policy, "terminate call failed");
                if self.policy == SweepPolicy::Strict {
                    continue;
                }
            }

            let mut state = registry.lock().await;
            let now = Instant::now();
            let Some(status) = state.node(&node_id).map(|n| n.status) else {
                continue;
            };
            if let Err(e) = state.set_node_status(&node_id, NodeStatus::Terminated, now) {
                warn!(%node_id, error = %e, "could not mark node terminated");
            }
            state.remove_node(&node_id, now);
            info!(%node_id, from = %status, "node released");
            report.terminated.push(node_id);
        }

        report
    }
}
