//! Durable, per-entity API request queue and processor.
//!
//! `outbox` accepts outbound mutation requests (`POST`/`PATCH`/... against a
//! remote server) from application code, persists them to disk so they
//! survive process restarts, and replays them with ordering, deduplication,
//! retry, and partial-failure semantics. The host supplies the HTTP
//! transport and subscribes a [`Handler`] to learn the outcome of each
//! request it enqueued.
//!
//! # Example
//! ```no_run
//! use outbox::{
//!     Body, IdentifierSnapshot, Method, Queue, QueueConfig, QueueingPolicy, Request,
//!     RequestConfig, RequestId, ReqwestClient,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = Arc::new(ReqwestClient::new("https://api.example.com"));
//!     let queue = Queue::open(QueueConfig::new("./outbox-queue"), transport, None).await?;
//!
//!     let request = Request {
//!         id: RequestId::new(),
//!         config: RequestConfig {
//!             method: Method::Post,
//!             path: "/widgets".to_string(),
//!             host_override: None,
//!             query: vec![],
//!             headers: vec![],
//!             body: Body::Raw(br#"{"name":"gadget"}"#.to_vec()),
//!             queueing_policy: QueueingPolicy::default(),
//!             background: false,
//!             timeout_secs: Some(30),
//!             deduplicate: false,
//!             tag: "create-widget".to_string(),
//!         },
//!         identifier_snapshot: Some(IdentifierSnapshot(b"local-widget-7".to_vec())),
//!     };
//!
//!     queue.append(request).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod facade;
pub mod merger;
pub mod processor;
pub mod queue;
pub mod request;
pub mod scheduler;
pub mod transport;

pub use config::{BackoffConfig, QueueConfig};
pub use dispatcher::{Dispatcher, Handler, HandlerToken, Outcome};
pub use error::{QueueError, Result};
pub use facade::Queue;
pub use merger::IdentifierExtractor;
pub use processor::{PullOutcome, Processor};
pub use queue::{DiskQueue, MemoryQueue, QueueStats, Storage};
pub use request::{
    Backoff, Body, IdentifierSnapshot, Method, QueryValue, QueueEntry, QueueingPolicy, Request,
    RequestConfig, RequestId, RetryPolicy,
};
pub use scheduler::{Scheduler, SchedulerState};
pub use transport::{MockTransport, NetworkClient, ReqwestClient, TransportRequest, TransportResponse};
