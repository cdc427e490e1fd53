//! podgrid-provider — the remote compute provider seam.
//!
//! The scheduler never talks to a provider API directly; it goes through
//! the [`ComputeProvider`] trait. [`HttpProvider`] implements it against a
//! JSON REST API. With the `in-memory` feature, `InMemoryProvider` offers a
//! scriptable stand-in that records every call.
//!
//! ```text
//! ComputeProvider
//!   ├── create_node / describe_node
//!   ├── start_node / stop_node / terminate_node
//!   └── list_storage_volumes
//! ```

pub mod client;
pub mod error;
#[cfg(any(test, feature = "in-memory"))]
pub mod memory;
pub mod types;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

pub use client::HttpProvider;
pub use error::{ProviderError, ProviderResult};
#[cfg(any(test, feature = "in-memory"))]
pub use memory::{InMemoryProvider, ProviderCall};
pub use types::*;

/// Operations the scheduler needs from a compute provider.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    async fn create_node(&self, request: &CreateNodeRequest) -> ProviderResult<CreatedNode>;

    async fn describe_node(&self, node_id: &str) -> ProviderResult<NodeDescriptor>;

    /// Resume a stopped node.
    async fn start_node(&self, node_id: &str) -> ProviderResult<()>;

    /// Stop a node without releasing it.
    async fn stop_node(&self, node_id: &str) -> ProviderResult<()>;

    /// Release a node permanently.
    async fn terminate_node(&self, node_id: &str) -> ProviderResult<()>;

    async fn list_storage_volumes(&self) -> ProviderResult<Vec<StorageVolume>>;
}

/// Run a provider call with an upper bound on its duration.
pub async fn bounded<T, F>(op: &'static str, timeout: Duration, call: F) -> ProviderResult<T>
where
    F: Future<Output = ProviderResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout { op, after: timeout }),
    }
}
