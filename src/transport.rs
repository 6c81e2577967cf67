//! The injected transport interface (spec §6) plus a production `reqwest`
//! implementation and a scriptable mock for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{QueueError, Result};
use crate::request::types::{Body, Method, QueryValue, RequestConfig};

/// Everything the transport needs to make one HTTP call; derived from a
/// `RequestConfig` at dispatch time.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub path: String,
    pub host_override: Option<String>,
    pub query: Vec<(String, QueryValue)>,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl From<&RequestConfig> for TransportRequest {
    fn from(c: &RequestConfig) -> Self {
        Self {
            method: c.method,
            path: c.path.clone(),
            host_override: c.host_override.clone(),
            query: c.query.clone(),
            headers: c.headers.clone(),
            body: c.body.clone(),
        }
    }
}

/// The transport's reply: a status code, headers, and a response body.
/// Classification into success/transient/terminal happens in
/// `crate::processor`, which has the queueing policy in scope.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status_code)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status_code)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code)
    }
}

/// Injected HTTP transport. Implementations must be safe to call
/// concurrently; the processor may dispatch several requests at once.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Perform the call, honoring `deadline` as a per-attempt timeout.
    /// Network-level failures (timeout, DNS failure, connection reset)
    /// surface as `QueueError::TransportTransient`.
    async fn send(
        &self,
        request: TransportRequest,
        deadline: Option<Duration>,
    ) -> Result<TransportResponse>;

    /// An optional connectivity signal (spec §6): a stream of connected/
    /// disconnected transitions the scheduler uses to move in and out of
    /// `waiting_for_connectivity`. `None` (the default) means the scheduler
    /// treats the system as always connected.
    fn connectivity(&self) -> Option<futures::stream::BoxStream<'static, bool>> {
        None
    }
}

// ============================================================================
// Production implementation using reqwest
// ============================================================================

/// Default `NetworkClient` backed by `reqwest`.
#[derive(Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
    default_host: String,
}

impl ReqwestClient {
    pub fn new(default_host: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            default_host: default_host.into(),
        }
    }
}

#[async_trait]
impl NetworkClient for ReqwestClient {
    #[tracing::instrument(skip(self, request), fields(path = %request.path))]
    async fn send(
        &self,
        request: TransportRequest,
        deadline: Option<Duration>,
    ) -> Result<TransportResponse> {
        let host = request.host_override.as_deref().unwrap_or(&self.default_host);
        let url = format!("{host}{}", request.path);

        let method: reqwest::Method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, &url);
        if let Some(timeout) = deadline {
            builder = builder.timeout(timeout);
        }

        let mut query_pairs: Vec<(String, String)> = Vec::new();
        for (key, value) in &request.query {
            match value {
                QueryValue::Single(v) => query_pairs.push((key.clone(), v.clone())),
                QueryValue::Multi(values) => {
                    for v in values {
                        query_pairs.push((key.clone(), v.clone()));
                    }
                }
            }
        }
        if !query_pairs.is_empty() {
            builder = builder.query(&query_pairs);
        }

        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }

        builder = match &request.body {
            Body::Raw(bytes) if !bytes.is_empty() => builder.body(bytes.clone()),
            Body::Form(pairs) if !pairs.is_empty() => builder.form(pairs),
            _ => builder,
        };

        let response = builder.send().await.map_err(|e| {
            tracing::warn!(error = %e, url = %url, "transport call failed");
            QueueError::TransportTransient(e.to_string())
        })?;

        let status_code = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| QueueError::TransportTransient(e.to_string()))?
            .to_vec();

        Ok(TransportResponse {
            status_code,
            headers,
            body,
        })
    }
}

// ============================================================================
// Test double
// ============================================================================

/// A single scripted reply, optionally gated behind a trigger the test
/// controls, mirroring how the teacher's mock client lets a test hold a
/// response open to assert concurrency limits.
enum ScriptedReply {
    Immediate(Result<TransportResponse>),
    Gated {
        reply: Result<TransportResponse>,
        gate: tokio::sync::watch::Receiver<bool>,
    },
}

/// Scriptable `NetworkClient` for tests. Replies are queued per
/// `"METHOD path"` key and consumed FIFO.
#[derive(Clone, Default)]
pub struct MockTransport {
    replies: Arc<Mutex<HashMap<String, Vec<ScriptedReply>>>>,
    calls: Arc<Mutex<Vec<TransportRequest>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(method: Method, path: &str) -> String {
        format!("{} {}", method.as_str(), path)
    }

    /// Queue a reply returned immediately on the next matching call.
    pub fn add_response(&self, method: Method, path: &str, reply: Result<TransportResponse>) {
        self.replies
            .lock()
            .entry(Self::key(method, path))
            .or_default()
            .push(ScriptedReply::Immediate(reply));
    }

    /// Queue a reply that won't resolve until the returned sender is
    /// triggered, used to assert in-flight concurrency.
    pub fn add_gated_response(
        &self,
        method: Method,
        path: &str,
        reply: Result<TransportResponse>,
    ) -> tokio::sync::watch::Sender<bool> {
        let (tx, rx) = tokio::sync::watch::channel(false);
        self.replies
            .lock()
            .entry(Self::key(method, path))
            .or_default()
            .push(ScriptedReply::Gated { reply, gate: rx });
        tx
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<TransportRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl NetworkClient for MockTransport {
    async fn send(
        &self,
        request: TransportRequest,
        _deadline: Option<Duration>,
    ) -> Result<TransportResponse> {
        self.calls.lock().push(request.clone());
        let key = Self::key(request.method, &request.path);

        let scripted = {
            let mut replies = self.replies.lock();
            replies.get_mut(&key).and_then(|queue| {
                if queue.is_empty() {
                    None
                } else {
                    Some(queue.remove(0))
                }
            })
        };

        match scripted {
            Some(ScriptedReply::Immediate(reply)) => reply,
            Some(ScriptedReply::Gated { reply, mut gate }) => {
                let _ = gate.wait_for(|triggered| *triggered).await;
                reply
            }
            None => Err(QueueError::TransportTerminal(format!(
                "no mock response configured for {key}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_response() -> TransportResponse {
        TransportResponse {
            status_code: 200,
            headers: vec![],
            body: b"ok".to_vec(),
        }
    }

    #[tokio::test]
    async fn mock_replies_fifo_per_key() {
        let mock = MockTransport::new();
        mock.add_response(Method::Get, "/x", Ok(ok_response()));
        mock.add_response(
            Method::Get,
            "/x",
            Ok(TransportResponse {
                status_code: 500,
                headers: vec![],
                body: vec![],
            }),
        );

        let req = TransportRequest {
            method: Method::Get,
            path: "/x".to_string(),
            host_override: None,
            query: vec![],
            headers: vec![],
            body: Body::Raw(vec![]),
        };

        let first = mock.send(req.clone(), None).await.unwrap();
        assert_eq!(first.status_code, 200);
        let second = mock.send(req, None).await.unwrap();
        assert_eq!(second.status_code, 500);
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn mock_errors_on_unconfigured_key() {
        let mock = MockTransport::new();
        let req = TransportRequest {
            method: Method::Post,
            path: "/unknown".to_string(),
            host_override: None,
            query: vec![],
            headers: vec![],
            body: Body::Raw(vec![]),
        };
        assert!(mock.send(req, None).await.is_err());
    }
}
