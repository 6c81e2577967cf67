//! The durable queue contract (spec §4.A) and its two backends.

pub mod disk;
pub mod keyspace;
pub mod memory;

pub use disk::DiskQueue;
pub use memory::MemoryQueue;

use async_trait::async_trait;

use crate::error::Result;
use crate::request::types::{QueueEntry, Request};

/// Point-in-time counts used for operational visibility; ambient addition,
/// not a mutation path (see SPEC_FULL.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub oldest_enqueued_at_millis: Option<i64>,
}

/// Ordered, two-ended, disk-backed (or in-memory) queue of serialized
/// requests. The sparse `u64` key-space algorithm is shared by both
/// implementations; see `disk::DiskQueue` for the canonical write-up.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Durably adds to the tail. Fails if the tail-side key-space is
    /// exhausted or the write fails.
    async fn append(&self, request: Request) -> Result<u64>;

    /// Durably adds to the head (used for retries). Fails if the head-side
    /// key-space is exhausted.
    async fn prepend(&self, request: Request) -> Result<u64>;

    /// Removes and returns the head entry, or `None` if empty.
    async fn drop_first(&self) -> Result<Option<QueueEntry>>;

    /// Inspects the head entry without removing it.
    async fn peek_first(&self) -> Result<Option<QueueEntry>>;

    /// Number of entries currently stored.
    async fn count(&self) -> Result<u64>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.count().await? == 0)
    }

    /// Rewrites every entry in place; used by the identifier merger.
    async fn map(&self, f: &(dyn Fn(Request) -> Request + Send + Sync)) -> Result<()>;

    /// In-place compaction: drops entries the predicate rejects while
    /// preserving relative order of the ones it keeps.
    async fn retain(&self, predicate: &(dyn Fn(&Request) -> bool + Send + Sync)) -> Result<()>;

    /// Snapshot of queue depth and age, for host status pages and tests.
    async fn stats(&self) -> Result<QueueStats>;
}
