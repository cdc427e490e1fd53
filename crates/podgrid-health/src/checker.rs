//! Service health probe logic.
//!
//! Performs an HTTP GET against a node's health endpoint and classifies
//! the answer. A JSON body that states readiness is the strict signal; a
//! bare 2xx without one is accepted as liveness.

use std::time::Duration;

use async_trait::async_trait;
use http_body_util::BodyExt;
use tracing::debug;

/// Status values accepted as "ready" in a structured health payload.
const READY_STATUSES: &[&str] = &["ok", "ready", "healthy"];

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// 2xx with a structured payload reporting ready.
    Ready,
    /// 2xx without a structured readiness field.
    Alive,
    /// 2xx with a structured payload reporting not ready (still loading).
    NotReady,
    /// Non-2xx response.
    Unhealthy,
    /// Connection error or timeout.
    Failed,
}

impl ProbeResult {
    /// Whether the node may be handed out for work.
    pub fn is_success(self) -> bool {
        matches!(self, ProbeResult::Ready | ProbeResult::Alive)
    }
}

/// Something that can check a node's service endpoint.
#[async_trait]
pub trait ServiceProbe: Send + Sync {
    async fn check(&self, address: &str, path: &str, timeout: Duration) -> ProbeResult;
}

/// [`ServiceProbe`] that issues a real HTTP/1.1 request.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpServiceProbe;

#[async_trait]
impl ServiceProbe for HttpServiceProbe {
    async fn check(&self, address: &str, path: &str, timeout: Duration) -> ProbeResult {
        http_probe(address, path, timeout).await
    }
}

/// Classify a health response from its status and body.
pub fn classify(success: bool, body: &[u8]) -> ProbeResult {
    if !success {
        return ProbeResult::Unhealthy;
    }

    let Ok(serde_json::Value::Object(map)) = serde_json::from_slice::<serde_json::Value>(body)
    else {
        return ProbeResult::Alive;
    };

    if let Some(ready) = map.get("ready").and_then(serde_json::Value::as_bool) {
        return if ready {
            ProbeResult::Ready
        } else {
            ProbeResult::NotReady
        };
    }

    match map.get("status").and_then(serde_json::Value::as_str) {
        Some(status) if READY_STATUSES.contains(&status.to_ascii_lowercase().as_str()) => {
            ProbeResult::Ready
        }
        Some(_) => ProbeResult::NotReady,
        None => ProbeResult::Alive,
    }
}

/// Perform an HTTP health probe against `address` (`host:port`).
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "podgrid-health/0.1")
            .header("accept", "application/json")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        let resp = match sender.send_request(req).await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                return ProbeResult::Failed;
            }
        };

        let status = resp.status();
        let body = match resp.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(error = %e, %uri, "health probe body read failed");
                return ProbeResult::Failed;
            }
        };

        let result = classify(status.is_success(), &body);
        debug!(status = %status, ?result, %uri, "health probe answered");
        result
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeResult::Failed
        }
    }
}
