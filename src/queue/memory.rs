//! Non-durable `Storage` backend: the same key-space algorithm as
//! `DiskQueue`, held entirely in memory. Documented as non-durable; never
//! the default, used for fast unit tests and hosts that explicitly opt out
//! of persistence.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::queue::keyspace::{self, EntryStore, KeySpace};
use crate::queue::{QueueStats, Storage};
use crate::request::types::{QueueEntry, Request};

#[derive(Default)]
struct Inner {
    keyspace: KeySpace,
    entries: BTreeMap<u64, QueueEntry>,
}

/// In-memory `Storage` implementation, grounded on `InMemoryStorage`'s
/// single-lock-guarded map.
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

struct SyncEntryStore<'a>(&'a Mutex<Inner>);

#[async_trait]
impl<'a> EntryStore for SyncEntryStore<'a> {
    async fn read(&self, key: u64) -> Result<Option<QueueEntry>> {
        Ok(self.0.lock().entries.get(&key).cloned())
    }

    async fn write(&self, key: u64, entry: &QueueEntry) -> Result<()> {
        self.0.lock().entries.insert(key, entry.clone());
        Ok(())
    }

    async fn remove(&self, key: u64) -> Result<()> {
        self.0.lock().entries.remove(&key);
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryQueue {
    async fn append(&self, request: Request) -> Result<u64> {
        let key = {
            let mut inner = self.inner.lock();
            let key = inner.keyspace.reserve_tail()?;
            inner.entries.insert(key, QueueEntry::fresh(key, request));
            key
        };
        Ok(key)
    }

    async fn prepend(&self, request: Request) -> Result<u64> {
        let key = {
            let mut inner = self.inner.lock();
            let key = inner.keyspace.reserve_head()?;
            inner.entries.insert(key, QueueEntry::fresh(key, request));
            key
        };
        Ok(key)
    }

    async fn drop_first(&self) -> Result<Option<QueueEntry>> {
        let mut inner = self.inner.lock();
        let Some(head) = inner.keyspace.head_key() else {
            return Ok(None);
        };
        let entry = inner.entries.remove(&head);
        inner.keyspace.advance_head();
        Ok(entry)
    }

    async fn peek_first(&self) -> Result<Option<QueueEntry>> {
        let inner = self.inner.lock();
        Ok(inner
            .keyspace
            .head_key()
            .and_then(|head| inner.entries.get(&head).cloned()))
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.inner.lock().keyspace.len())
    }

    async fn map(&self, f: &(dyn Fn(Request) -> Request + Send + Sync)) -> Result<()> {
        let keyspace = self.inner.lock().keyspace;
        let store = SyncEntryStore(&self.inner);
        keyspace::apply_map(&store, &keyspace, f).await
    }

    async fn retain(&self, predicate: &(dyn Fn(&Request) -> bool + Send + Sync)) -> Result<()> {
        let mut keyspace = self.inner.lock().keyspace;
        let store = SyncEntryStore(&self.inner);
        keyspace::apply_retain(&store, &mut keyspace, predicate).await?;
        self.inner.lock().keyspace = keyspace;
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let inner = self.inner.lock();
        let oldest = inner
            .keyspace
            .head_key()
            .and_then(|head| inner.entries.get(&head))
            .map(|e| e.enqueued_at.timestamp_millis());
        Ok(QueueStats {
            pending: inner.keyspace.len(),
            oldest_enqueued_at_millis: oldest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::types::{Body, Method, QueueingPolicy, RequestConfig, RequestId};

    fn sample_request(tag: &str) -> Request {
        Request {
            id: RequestId::new(),
            config: RequestConfig {
                method: Method::Post,
                path: "/widgets".to_string(),
                host_override: None,
                query: vec![],
                headers: vec![],
                body: Body::Raw(tag.as_bytes().to_vec()),
                queueing_policy: QueueingPolicy::default(),
                background: false,
                timeout_secs: None,
                deduplicate: false,
                tag: tag.to_string(),
            },
            identifier_snapshot: None,
        }
    }

    #[tokio::test]
    async fn append_then_drop_first_preserves_fifo_order() {
        let q = MemoryQueue::new();
        q.append(sample_request("r1")).await.unwrap();
        q.append(sample_request("r2")).await.unwrap();
        q.append(sample_request("r3")).await.unwrap();

        let first = q.drop_first().await.unwrap().unwrap();
        assert_eq!(first.request.config.tag, "r1");
        let second = q.drop_first().await.unwrap().unwrap();
        assert_eq!(second.request.config.tag, "r2");
        let third = q.drop_first().await.unwrap().unwrap();
        assert_eq!(third.request.config.tag, "r3");
        assert!(q.drop_first().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prepend_runs_before_existing_queue() {
        let q = MemoryQueue::new();
        q.append(sample_request("original")).await.unwrap();
        q.prepend(sample_request("retry")).await.unwrap();

        let first = q.drop_first().await.unwrap().unwrap();
        assert_eq!(first.request.config.tag, "retry");
        let second = q.drop_first().await.unwrap().unwrap();
        assert_eq!(second.request.config.tag, "original");
    }

    #[tokio::test]
    async fn retain_is_idempotent() {
        let q = MemoryQueue::new();
        for tag in ["keep", "drop", "keep2"] {
            q.append(sample_request(tag)).await.unwrap();
        }
        let predicate = |r: &Request| r.config.tag.starts_with("keep");
        q.retain(&predicate).await.unwrap();
        let after_first = q.count().await.unwrap();
        q.retain(&predicate).await.unwrap();
        let after_second = q.count().await.unwrap();
        assert_eq!(after_first, after_second);
        assert_eq!(after_first, 2);
    }

    #[tokio::test]
    async fn map_preserves_count_and_order() {
        let q = MemoryQueue::new();
        for tag in ["a", "b", "c"] {
            q.append(sample_request(tag)).await.unwrap();
        }
        let before = q.count().await.unwrap();
        q.map(&|mut r: Request| {
            r.config.tag.push_str("-mapped");
            r
        })
        .await
        .unwrap();
        let after = q.count().await.unwrap();
        assert_eq!(before, after);

        let first = q.drop_first().await.unwrap().unwrap();
        assert_eq!(first.request.config.tag, "a-mapped");
    }
}
