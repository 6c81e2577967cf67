//! Facade (spec §4.G): the thread-safe front door applications embed.
//! Owns every other component and serializes access to the queue's
//! key-space and in-flight bookkeeping through them.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::config::QueueConfig;
use crate::dispatcher::{Dispatcher, Handler, HandlerToken};
use crate::error::Result;
use crate::merger::IdentifierExtractor;
use crate::processor::Processor;
use crate::queue::{DiskQueue, MemoryQueue, QueueStats, Storage};
use crate::request::types::{Request, RequestId};
use crate::scheduler::Scheduler;
use crate::transport::NetworkClient;

/// A durable, per-entity API request queue: accepts outbound mutation
/// requests, persists them, and replays them to `transport` with ordering,
/// deduplication, retry, and partial-failure semantics.
///
/// # Example
/// ```no_run
/// use outbox::{Queue, QueueConfig, ReqwestClient};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let transport = Arc::new(ReqwestClient::new("https://api.example.com"));
///     let queue = Queue::open(QueueConfig::new("./outbox-queue"), transport, None).await?;
///
///     // `append` returns once the request is durably on disk; dispatch
///     // happens in the background.
///     // queue.append(request).await?;
///     Ok(())
/// }
/// ```
pub struct Queue {
    storage: Arc<dyn Storage>,
    processor: Arc<Processor>,
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<Dispatcher>,
    driver: JoinHandle<()>,
    connectivity_watcher: Option<JoinHandle<()>>,
}

impl Queue {
    /// Opens (or creates) a crash-safe, disk-backed queue at
    /// `config.storage_path` and starts its drive loop.
    pub async fn open(
        config: QueueConfig,
        transport: Arc<dyn NetworkClient>,
        identifier_extractor: Option<IdentifierExtractor>,
    ) -> Result<Self> {
        let storage = Arc::new(DiskQueue::open(&config.storage_path).await?);
        Ok(Self::with_storage(storage, config, transport, identifier_extractor))
    }

    /// Builds a non-durable queue for tests or hosts that explicitly opt out
    /// of persistence (see `MemoryQueue`'s doc comment).
    pub fn in_memory(
        config: QueueConfig,
        transport: Arc<dyn NetworkClient>,
        identifier_extractor: Option<IdentifierExtractor>,
    ) -> Self {
        Self::with_storage(Arc::new(MemoryQueue::new()), config, transport, identifier_extractor)
    }

    fn with_storage(
        storage: Arc<dyn Storage>,
        config: QueueConfig,
        transport: Arc<dyn NetworkClient>,
        identifier_extractor: Option<IdentifierExtractor>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new());
        let scheduler = Scheduler::new();
        let connectivity = transport.connectivity();
        let processor = Arc::new(Processor::new(
            storage.clone(),
            transport,
            dispatcher.clone(),
            scheduler.clone(),
            config,
            identifier_extractor,
        ));

        let driver = tokio::spawn(scheduler.clone().run(processor.clone()));
        let connectivity_watcher = connectivity.map(|stream| {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let mut stream = stream;
                while let Some(connected) = stream.next().await {
                    scheduler.set_connected(connected);
                }
            })
        });

        Self {
            storage,
            processor,
            scheduler,
            dispatcher,
            driver,
            connectivity_watcher,
        }
    }

    /// Durably appends `request` to the tail and wakes the scheduler.
    #[tracing::instrument(skip(self, request))]
    pub async fn append(&self, request: Request) -> Result<u64> {
        let position = self.storage.append(request).await?;
        self.scheduler.did_enqueue_new_request();
        Ok(position)
    }

    /// Subscribes `handler` to every outcome the queue produces.
    pub async fn register(&self, handler: Arc<dyn Handler>) -> HandlerToken {
        self.processor.register(handler).await
    }

    pub async fn unregister(&self, token: HandlerToken) {
        self.processor.unregister(token).await
    }

    /// Cancels a queued or in-flight request. Returns `true` if a matching
    /// request was found.
    pub async fn abort(&self, request_id: RequestId) -> Result<bool> {
        self.processor.abort(request_id).await
    }

    /// Forces an immediate dispatch attempt, clearing any pending backoff.
    pub fn flush(&self) {
        self.scheduler.flush();
    }

    /// Rewrites every queued request through `f`; used directly by hosts
    /// that need bespoke rewrites beyond the identifier merger's byte-pattern
    /// substitution.
    pub async fn map(&self, f: impl Fn(Request) -> Request + Send + Sync) -> Result<()> {
        self.storage.map(&f).await
    }

    pub async fn count(&self) -> Result<u64> {
        self.storage.count().await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        self.storage.is_empty().await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.storage.stats().await
    }

    /// Stops the drive loop and cancels any outstanding backoff timer. The
    /// queue's on-disk contents are untouched; reopening the same
    /// `storage_path` resumes where this instance left off.
    pub async fn shutdown(self) {
        self.scheduler.shutdown();
        self.driver.abort();
        let _ = self.driver.await;
        if let Some(watcher) = self.connectivity_watcher {
            watcher.abort();
            let _ = watcher.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::types::{Body, Method, QueueingPolicy, RequestConfig};
    use crate::transport::MockTransport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        successes: AtomicUsize,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn on_outcome(&self, _request: &Request, outcome: &crate::dispatcher::Outcome) {
            if matches!(outcome, crate::dispatcher::Outcome::Success { .. }) {
                self.successes.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn sample_request(path: &str) -> Request {
        Request {
            id: RequestId::new(),
            config: RequestConfig {
                method: Method::Post,
                path: path.to_string(),
                host_override: None,
                query: vec![],
                headers: vec![],
                body: Body::Raw(vec![]),
                queueing_policy: QueueingPolicy::default(),
                background: false,
                timeout_secs: None,
                deduplicate: false,
                tag: String::new(),
            },
            identifier_snapshot: None,
        }
    }

    #[tokio::test]
    async fn fifo_without_failure() {
        let transport = Arc::new(MockTransport::new());
        for path in ["/r1", "/r2", "/r3"] {
            transport.add_response(
                Method::Post,
                path,
                Ok(crate::transport::TransportResponse {
                    status_code: 200,
                    headers: vec![],
                    body: vec![],
                }),
            );
        }

        let queue = Queue::in_memory(QueueConfig::default(), transport.clone(), None);
        let handler = Arc::new(CountingHandler { successes: AtomicUsize::new(0) });
        queue.register(handler.clone()).await;

        queue.append(sample_request("/r1")).await.unwrap();
        queue.append(sample_request("/r2")).await.unwrap();
        queue.append(sample_request("/r3")).await.unwrap();

        for _ in 0..200 {
            if handler.successes.load(Ordering::SeqCst) == 3 && queue.is_empty().await.unwrap() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(handler.successes.load(Ordering::SeqCst), 3);
        assert!(queue.is_empty().await.unwrap());
        queue.shutdown().await;
    }
}
