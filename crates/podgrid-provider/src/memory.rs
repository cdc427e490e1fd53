//! Scriptable in-memory provider for tests.
//!
//! Nodes boot after a configurable number of `describe_node` polls.
//! Individual hardware variants can be made to reject creation or to
//! fail while booting, and lifecycle calls can be made to error. Every
//! call is recorded in order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{ProviderError, ProviderResult};
use crate::types::*;
use crate::ComputeProvider;

/// A recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Create { hardware: String },
    Describe(String),
    Start(String),
    Stop(String),
    Terminate(String),
    ListStorage,
}

struct FakeNode {
    request: CreateNodeRequest,
    status: ProviderNodeStatus,
    polls: u32,
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, FakeNode>,
    next_id: u64,
    calls: Vec<ProviderCall>,
    volumes: Vec<StorageVolume>,
    reject_hardware: BTreeSet<String>,
    crash_hardware: BTreeSet<String>,
    boot_polls: u32,
    hide_ports: bool,
    fail_start: bool,
    fail_stop: bool,
    fail_terminate: bool,
}

/// In-memory [`ComputeProvider`].
pub struct InMemoryProvider {
    inner: Mutex<Inner>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Offset between a container port and its published port.
const PUBLIC_PORT_OFFSET: u16 = 30_000;

impl InMemoryProvider {
    /// A provider whose nodes report running on the first describe.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                boot_polls: 1,
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reject `create_node` for a hardware variant.
    pub fn reject_hardware(self, hardware: &str) -> Self {
        self.lock().reject_hardware.insert(hardware.to_string());
        self
    }

    /// Nodes on this hardware report `failed` instead of booting.
    pub fn crash_on_boot(self, hardware: &str) -> Self {
        self.lock().crash_hardware.insert(hardware.to_string());
        self
    }

    /// Number of describe polls before a node reports running.
    pub fn boot_after(self, polls: u32) -> Self {
        self.lock().boot_polls = polls;
        self
    }

    /// Running nodes report no port mappings.
    pub fn hide_ports(self) -> Self {
        self.lock().hide_ports = true;
        self
    }

    pub fn with_volume(self, id: &str, name: &str) -> Self {
        self.lock().volumes.push(StorageVolume {
            id: id.to_string(),
            name: name.to_string(),
            size_gb: 100,
            datacenter: None,
        });
        self
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.lock().fail_start = fail;
    }

    pub fn set_fail_stop(&self, fail: bool) {
        self.lock().fail_stop = fail;
    }

    pub fn set_fail_terminate(&self, fail: bool) {
        self.lock().fail_terminate = fail;
    }

    /// Force a node into a provider status.
    pub fn set_status(&self, node_id: &str, status: ProviderNodeStatus) {
        if let Some(node) = self.lock().nodes.get_mut(node_id) {
            node.status = status;
        }
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Hardware variants passed to `create_node`, in call order.
    pub fn create_attempts(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                ProviderCall::Create { hardware } => Some(hardware.clone()),
                _ => None,
            })
            .collect()
    }

    /// Nodes that have not been terminated.
    pub fn live_nodes(&self) -> Vec<String> {
        self.lock()
            .nodes
            .iter()
            .filter(|(_, n)| n.status != ProviderNodeStatus::Terminated)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn node_status(&self, node_id: &str) -> Option<ProviderNodeStatus> {
        self.lock().nodes.get(node_id).map(|n| n.status)
    }

    /// The create request a node was built from.
    pub fn node_request(&self, node_id: &str) -> Option<CreateNodeRequest> {
        self.lock().nodes.get(node_id).map(|n| n.request.clone())
    }
}

#[async_trait]
impl ComputeProvider for InMemoryProvider {
    async fn create_node(&self, request: &CreateNodeRequest) -> ProviderResult<CreatedNode> {
        let mut inner = self.lock();
        inner.calls.push(ProviderCall::Create {
            hardware: request.hardware.clone(),
        });
        if inner.reject_hardware.contains(&request.hardware) {
            return Err(ProviderError::Rejected(format!(
                "no capacity for {}",
                request.hardware
            )));
        }

        inner.next_id += 1;
        let id = format!("pod-{}", inner.next_id);
        inner.nodes.insert(
            id.clone(),
            FakeNode {
                request: request.clone(),
                status: ProviderNodeStatus::Starting,
                polls: 0,
            },
        );
        Ok(CreatedNode { id })
    }

    async fn describe_node(&self, node_id: &str) -> ProviderResult<NodeDescriptor> {
        let mut inner = self.lock();
        inner.calls.push(ProviderCall::Describe(node_id.to_string()));
        let boot_polls = inner.boot_polls;
        let hide_ports = inner.hide_ports;
        let crashes = inner
            .nodes
            .get(node_id)
            .is_some_and(|n| inner.crash_hardware.contains(&n.request.hardware));

        let node = inner
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| ProviderError::NotFound(node_id.to_string()))?;
        node.polls += 1;
        if node.status == ProviderNodeStatus::Starting && node.polls >= boot_polls {
            node.status = if crashes {
                ProviderNodeStatus::Failed
            } else {
                ProviderNodeStatus::Running
            };
        }

        let ports = if node.status == ProviderNodeStatus::Running && !hide_ports {
            node.request
                .ports
                .iter()
                .map(|&p| PortMapping {
                    private_port: p,
                    public_port: p.saturating_add(PUBLIC_PORT_OFFSET),
                    protocol: "tcp".to_string(),
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(NodeDescriptor {
            id: node_id.to_string(),
            status: node.status,
            public_ip: Some("127.0.0.1".to_string()),
            ports,
            hardware: Some(node.request.hardware.clone()),
        })
    }

    async fn start_node(&self, node_id: &str) -> ProviderResult<()> {
        let mut inner = self.lock();
        inner.calls.push(ProviderCall::Start(node_id.to_string()));
        if inner.fail_start {
            return Err(ProviderError::Rejected("start refused".to_string()));
        }
        let node = inner
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| ProviderError::NotFound(node_id.to_string()))?;
        node.status = ProviderNodeStatus::Running;
        Ok(())
    }

    async fn stop_node(&self, node_id: &str) -> ProviderResult<()> {
        let mut inner = self.lock();
        inner.calls.push(ProviderCall::Stop(node_id.to_string()));
        if inner.fail_stop {
            return Err(ProviderError::Rejected("stop refused".to_string()));
        }
        let node = inner
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| ProviderError::NotFound(node_id.to_string()))?;
        node.status = ProviderNodeStatus::Stopped;
        Ok(())
    }

    async fn terminate_node(&self, node_id: &str) -> ProviderResult<()> {
        let mut inner = self.lock();
        inner.calls.push(ProviderCall::Terminate(node_id.to_string()));
        if inner.fail_terminate {
            return Err(ProviderError::Rejected("terminate refused".to_string()));
        }
        let node = inner
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| ProviderError::NotFound(node_id.to_string()))?;
        node.status = ProviderNodeStatus::Terminated;
        Ok(())
    }

    async fn list_storage_volumes(&self) -> ProviderResult<Vec<StorageVolume>> {
        let mut inner = self.lock();
        inner.calls.push(ProviderCall::ListStorage);
        Ok(inner.volumes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(hardware: &str) -> CreateNodeRequest {
        CreateNodeRequest {
            name: "podgrid-render".to_string(),
            image: "img".to_string(),
            hardware: hardware.to_string(),
            disk_gb: 20,
            ports: vec![8188],
            storage_volume_id: None,
            env: Default::default(),
        }
    }

    #[tokio::test]
    async fn node_boots_after_polls() {
        let provider = InMemoryProvider::new().boot_after(2);
        let created = provider.create_node(&request("A40")).await.unwrap();

        let first = provider.describe_node(&created.id).await.unwrap();
        assert_eq!(first.status, ProviderNodeStatus::Starting);
        assert!(first.ports.is_empty());

        let second = provider.describe_node(&created.id).await.unwrap();
        assert_eq!(second.status, ProviderNodeStatus::Running);
        assert_eq!(second.endpoint(8188), Some(("127.0.0.1".to_string(), 38188)));
    }

    #[tokio::test]
    async fn rejected_hardware_creates_nothing() {
        let provider = InMemoryProvider::new().reject_hardware("A100");
        assert!(provider.create_node(&request("A100")).await.is_err());
        assert!(provider.live_nodes().is_empty());
        assert_eq!(provider.create_attempts(), vec!["A100"]);
    }

    #[tokio::test]
    async fn crash_on_boot_reports_failed() {
        let provider = InMemoryProvider::new().crash_on_boot("A40");
        let created = provider.create_node(&request("A40")).await.unwrap();
        let desc = provider.describe_node(&created.id).await.unwrap();
        assert_eq!(desc.status, ProviderNodeStatus::Failed);
    }

    #[tokio::test]
    async fn lifecycle_calls_update_status() {
        let provider = InMemoryProvider::new();
        let id = provider.create_node(&request("A40")).await.unwrap().id;

        provider.stop_node(&id).await.unwrap();
        assert_eq!(provider.node_status(&id), Some(ProviderNodeStatus::Stopped));
        provider.start_node(&id).await.unwrap();
        assert_eq!(provider.node_status(&id), Some(ProviderNodeStatus::Running));

        provider.set_fail_terminate(true);
        assert!(provider.terminate_node(&id).await.is_err());
        provider.set_fail_terminate(false);
        provider.terminate_node(&id).await.unwrap();
        assert!(provider.live_nodes().is_empty());

        assert_eq!(
            provider.calls(),
            vec![
                ProviderCall::Create {
                    hardware: "A40".to_string()
                },
                ProviderCall::Stop(id.clone()),
                ProviderCall::Start(id.clone()),
                ProviderCall::Terminate(id.clone()),
                ProviderCall::Terminate(id.clone()),
            ]
        );
    }
}
