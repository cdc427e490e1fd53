//! REST client for a compute provider.
//!
//! Speaks a small JSON API:
//!
//! | Method | Path | Call |
//! |---|---|---|
//! | POST | `/nodes` | create |
//! | GET | `/nodes/{id}` | describe |
//! | POST | `/nodes/{id}/start` | start |
//! | POST | `/nodes/{id}/stop` | stop |
//! | DELETE | `/nodes/{id}` | terminate |
//! | GET | `/storage-volumes` | storage catalog |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};
use crate::types::*;
use crate::ComputeProvider;

/// [`ComputeProvider`] backed by the provider's REST API.
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpProvider {
    /// Build a client. Every request is bounded by `timeout`.
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("podgrid/0.1")
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn execute(
        &self,
        op: &'static str,
        node_id: Option<&str>,
        builder: RequestBuilder,
    ) -> ProviderResult<Response> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout {
                    op,
                    after: self.timeout,
                }
            } else {
                ProviderError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND
            && let Some(id) = node_id
        {
            return Err(ProviderError::NotFound(id.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(%op, status = status.as_u16(), %body, "provider call failed");
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> ProviderResult<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ComputeProvider for HttpProvider {
    async fn create_node(&self, request: &CreateNodeRequest) -> ProviderResult<CreatedNode> {
        let builder = self.request(Method::POST, "/nodes").json(request);
        let response = self.execute("create_node", None, builder).await?;
        Self::decode(response).await
    }

    async fn describe_node(&self, node_id: &str) -> ProviderResult<NodeDescriptor> {
        let builder = self.request(Method::GET, &format!("/nodes/{node_id}"));
        let response = self.execute("describe_node", Some(node_id), builder).await?;
        Self::decode(response).await
    }

    async fn start_node(&self, node_id: &str) -> ProviderResult<()> {
        let builder = self.request(Method::POST, &format!("/nodes/{node_id}/start"));
        self.execute("start_node", Some(node_id), builder).await?;
        Ok(())
    }

    async fn stop_node(&self, node_id: &str) -> ProviderResult<()> {
        let builder = self.request(Method::POST, &format!("/nodes/{node_id}/stop"));
        self.execute("stop_node", Some(node_id), builder).await?;
        Ok(())
    }

    async fn terminate_node(&self, node_id: &str) -> ProviderResult<()> {
        let builder = self.request(Method::DELETE, &format!("/nodes/{node_id}"));
        self.execute("terminate_node", Some(node_id), builder).await?;
        Ok(())
    }

    async fn list_storage_volumes(&self) -> ProviderResult<Vec<StorageVolume>> {
        let builder = self.request(Method::GET, "/storage-volumes");
        let response = self.execute("list_storage_volumes", None, builder).await?;
        Self::decode(response).await
    }
}
