//! Wire types exchanged with the compute provider.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Everything the provider needs to create one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateNodeRequest {
    pub name: String,
    pub image: String,
    /// Hardware variant identifier, e.g. "NVIDIA RTX 4090".
    pub hardware: String,
    pub disk_gb: u32,
    /// Container ports that must be exposed publicly.
    pub ports: Vec<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_volume_id: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Provider response to a successful create.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatedNode {
    pub id: String,
}

/// Node state as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderNodeStatus {
    Pending,
    Starting,
    Running,
    Stopped,
    Exited,
    Failed,
    Terminated,
    #[serde(other)]
    Unknown,
}

impl ProviderNodeStatus {
    /// States a booting node never comes back from.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProviderNodeStatus::Failed | ProviderNodeStatus::Terminated | ProviderNodeStatus::Exited
        )
    }
}

/// A container port published on the node's public address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    pub private_port: u16,
    pub public_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Latest provider view of a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeDescriptor {
    pub id: String,
    pub status: ProviderNodeStatus,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub hardware: Option<String>,
}

impl NodeDescriptor {
    pub fn port_mapping(&self, private_port: u16) -> Option<&PortMapping> {
        self.ports.iter().find(|p| p.private_port == private_port)
    }

    /// Public `(address, port)` for a container port, once both are known.
    pub fn endpoint(&self, private_port: u16) -> Option<(String, u16)> {
        let ip = self.public_ip.as_ref().filter(|ip| !ip.is_empty())?;
        let mapping = self.port_mapping(private_port)?;
        Some((ip.clone(), mapping.public_port))
    }
}

/// A network volume from the provider's storage catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageVolume {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size_gb: u32,
    #[serde(default)]
    pub datacenter: Option<String>,
}
