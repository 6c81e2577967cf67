//! Core request data model: the immutable record enqueued by callers, the
//! on-disk `QueueEntry` wrapper, and the typestate lifecycle the processor
//! drives a request through while it's in flight.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::error::Result;
use crate::transport::TransportResponse;

/// Stable identifier a caller can use to track a submission across its
/// lifetime, independent of its current `position` in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// HTTP method a `RequestConfig` may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

/// A query parameter value: either a single value or a repeated key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryValue {
    Single(String),
    Multi(Vec<String>),
}

/// The request body, either raw bytes or form-url-encoded pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    Raw(Vec<u8>),
    Form(Vec<(String, String)>),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Raw(b) => b.is_empty(),
            Body::Form(pairs) => pairs.is_empty(),
        }
    }
}

/// Which failures a queued request is willing to have retried, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// Fire-and-forget: any failure drops the request.
    None,
    /// Exponential backoff restricted to transient network errors.
    RetryOnNetworkErrors,
    /// Also retry on 5xx.
    RetryAlways,
}

/// Per-request backoff override; falls back to `QueueConfig::default_backoff`
/// when absent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    pub initial_ms: u64,
    pub multiplier: u64,
    pub max_ms: u64,
}

impl From<crate::config::BackoffConfig> for Backoff {
    fn from(c: crate::config::BackoffConfig) -> Self {
        Self {
            initial_ms: c.initial_ms,
            multiplier: c.multiplier,
            max_ms: c.max_ms,
        }
    }
}

impl From<Backoff> for crate::config::BackoffConfig {
    fn from(b: Backoff) -> Self {
        Self {
            initial_ms: b.initial_ms,
            multiplier: b.multiplier,
            max_ms: b.max_ms,
        }
    }
}

/// The queueing policy carried on each request, per spec §4.C.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueingPolicy {
    pub retry_policy: RetryPolicy,
    pub max_attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    /// A barrier must complete before any later request may dispatch.
    pub barrier: bool,
}

impl Default for QueueingPolicy {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::RetryOnNetworkErrors,
            max_attempts: None,
            backoff: None,
            barrier: false,
        }
    }
}

/// Opaque bytes carrying the local identifier(s) a queued request referenced
/// at enqueue time. The queue never interprets these bytes except through
/// `rewrite` (see `crate::merger`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierSnapshot(pub Vec<u8>);

/// Immutable description of an outbound mutation, independent of where it
/// currently sits in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConfig {
    pub method: Method,
    pub path: String,
    pub host_override: Option<String>,
    pub query: Vec<(String, QueryValue)>,
    pub headers: Vec<(String, String)>,
    pub body: Body,
    pub queueing_policy: QueueingPolicy,
    pub background: bool,
    pub timeout_secs: Option<u64>,
    pub deduplicate: bool,
    pub tag: String,
}

impl RequestConfig {
    /// Byte-identical comparison, used for dedup and for the identifier
    /// merger's exact-bytes substitution.
    pub fn same_bytes(&self, other: &RequestConfig) -> bool {
        match (serde_json::to_vec(self), serde_json::to_vec(other)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// Rewrites every occurrence of `old_local` to `new_remote` across path,
    /// query, headers, and body, field by field on each field's own literal
    /// bytes (spec §4.F). `Body::Raw` is substituted as raw bytes directly;
    /// every other field is a `String` and goes through `substitute_string`.
    fn rewritten(&self, old_local: &[u8], new_remote: &[u8]) -> RequestConfig {
        RequestConfig {
            method: self.method,
            path: substitute_string(&self.path, old_local, new_remote),
            host_override: self.host_override.clone(),
            query: self
                .query
                .iter()
                .map(|(k, v)| (substitute_string(k, old_local, new_remote), v.rewritten(old_local, new_remote)))
                .collect(),
            headers: self
                .headers
                .iter()
                .map(|(k, v)| (substitute_string(k, old_local, new_remote), substitute_string(v, old_local, new_remote)))
                .collect(),
            body: self.body.rewritten(old_local, new_remote),
            queueing_policy: self.queueing_policy,
            background: self.background,
            timeout_secs: self.timeout_secs,
            deduplicate: self.deduplicate,
            tag: self.tag.clone(),
        }
    }
}

impl QueryValue {
    fn rewritten(&self, old_local: &[u8], new_remote: &[u8]) -> QueryValue {
        match self {
            QueryValue::Single(v) => QueryValue::Single(substitute_string(v, old_local, new_remote)),
            QueryValue::Multi(vs) => {
                QueryValue::Multi(vs.iter().map(|v| substitute_string(v, old_local, new_remote)).collect())
            }
        }
    }
}

impl Body {
    fn rewritten(&self, old_local: &[u8], new_remote: &[u8]) -> Body {
        match self {
            Body::Raw(bytes) => Body::Raw(crate::request::codec::substitute_bytes(bytes, old_local, new_remote)),
            Body::Form(pairs) => Body::Form(
                pairs
                    .iter()
                    .map(|(k, v)| (substitute_string(k, old_local, new_remote), substitute_string(v, old_local, new_remote)))
                    .collect(),
            ),
        }
    }
}

/// Substitutes `old_local` for `new_remote` in `s`'s own bytes, falling back
/// to the original string if the result isn't valid UTF-8 (it always will be
/// when both needle and replacement are themselves valid UTF-8, but a host
/// could hand the merger arbitrary bytes).
fn substitute_string(s: &str, old_local: &[u8], new_remote: &[u8]) -> String {
    let rewritten = crate::request::codec::substitute_bytes(s.as_bytes(), old_local, new_remote);
    String::from_utf8(rewritten).unwrap_or_else(|_| s.to_string())
}

/// The full record a caller submits: config plus an optional identifier
/// snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub config: RequestConfig,
    pub identifier_snapshot: Option<IdentifierSnapshot>,
}

impl Request {
    /// Rewrites every occurrence of `old_local` to `new_remote` across this
    /// request's path, query, header, body, and snapshot bytes alike (spec
    /// §4.B/§4.F), operating on each field's own literal bytes rather than on
    /// a serialized whole — `Body::Raw` and `IdentifierSnapshot` are substituted
    /// as raw bytes, so this works regardless of what serialization format the
    /// entry is persisted in.
    pub fn rewritten(&self, old_local: &[u8], new_remote: &[u8]) -> Request {
        Request {
            id: self.id,
            config: self.config.rewritten(old_local, new_remote),
            identifier_snapshot: self.identifier_snapshot.as_ref().map(|snapshot| {
                IdentifierSnapshot(crate::request::codec::substitute_bytes(&snapshot.0, old_local, new_remote))
            }),
        }
    }
}

/// A single persisted record: `(position, request, enqueuedAt, attemptCount)`,
/// per spec §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub position: u64,
    pub request: Request,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
}

impl QueueEntry {
    pub fn fresh(position: u64, request: Request) -> Self {
        Self {
            position,
            request,
            enqueued_at: Utc::now(),
            attempt_count: 0,
        }
    }
}

// ============================================================================
// Processor-side typestate lifecycle
// ============================================================================
//
// `QueueEntry` is the durable record; `Request<T>` below is the processor's
// in-memory view of one entry while it's being dispatched. It is never
// persisted directly.

/// Marker trait for valid in-flight lifecycle states.
pub trait RequestState: Send + Sync {}

/// A `QueueEntry` in a particular stage of the processor's dispatch
/// lifecycle.
#[derive(Debug, Clone)]
pub struct Dispatch<T: RequestState> {
    pub state: T,
    pub entry: QueueEntry,
}

/// Waiting to be pulled by the processor.
#[derive(Debug, Clone)]
pub struct Pending;
impl RequestState for Pending {}

/// Dispatched to the transport; the HTTP call is running on a spawned task.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub started_at: DateTime<Utc>,
    pub result_rx: Arc<AsyncMutex<mpsc::Receiver<Result<TransportResponse>>>>,
    pub abort_handle: AbortHandle,
}
impl RequestState for InFlight {}

/// Terminal success.
#[derive(Debug, Clone)]
pub struct Completed {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub completed_at: DateTime<Utc>,
}
impl RequestState for Completed {}

/// Terminal failure (retries exhausted or non-retriable).
#[derive(Debug, Clone)]
pub struct Failed {
    pub status_code: Option<u16>,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}
impl RequestState for Failed {}

/// Explicitly cancelled, or timed out.
#[derive(Debug, Clone)]
pub struct Aborted {
    pub reason: String,
    pub aborted_at: DateTime<Utc>,
}
impl RequestState for Aborted {}

/// A dispatch in any lifecycle state, used where the processor must handle
/// them uniformly (e.g. the in-flight registry).
#[derive(Debug, Clone)]
pub enum AnyDispatch {
    Pending(Dispatch<Pending>),
    InFlight(Dispatch<InFlight>),
    Completed(Dispatch<Completed>),
    Failed(Dispatch<Failed>),
    Aborted(Dispatch<Aborted>),
}

impl AnyDispatch {
    pub fn position(&self) -> u64 {
        match self {
            AnyDispatch::Pending(d) => d.entry.position,
            AnyDispatch::InFlight(d) => d.entry.position,
            AnyDispatch::Completed(d) => d.entry.position,
            AnyDispatch::Failed(d) => d.entry.position,
            AnyDispatch::Aborted(d) => d.entry.position,
        }
    }
}
