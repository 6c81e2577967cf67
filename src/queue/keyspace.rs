//! The sparse `u64` position key-space shared by both `Storage` backends
//! (spec §4.A), plus the `map`/`retain` algorithms expressed generically
//! over a small `EntryStore` trait so disk and memory storage don't
//! duplicate the compaction logic.

use async_trait::async_trait;

use crate::error::{QueueError, Result};
use crate::request::types::{QueueEntry, Request};

/// Midpoint of the `u64` range; both `head` and `tail` start here so a queue
/// can grow in either direction before either side overflows.
pub const MIDPOINT: u64 = u64::MAX / 2;

/// Tracks the occupied range `[head, tail)`. Empty when `head == tail`.
#[derive(Debug, Clone, Copy)]
pub struct KeySpace {
    pub head: u64,
    pub tail: u64,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self {
            head: MIDPOINT,
            tail: MIDPOINT,
        }
    }
}

impl KeySpace {
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn len(&self) -> u64 {
        self.tail - self.head
    }

    /// Reserve the next tail slot for `append`.
    pub fn reserve_tail(&mut self) -> Result<u64> {
        let key = self.tail;
        self.tail = self
            .tail
            .checked_add(1)
            .ok_or_else(|| QueueError::StorageFull("tail key-space exhausted".to_string()))?;
        Ok(key)
    }

    /// Reserve the next head slot for `prepend`.
    pub fn reserve_head(&mut self) -> Result<u64> {
        let key = self
            .head
            .checked_sub(1)
            .ok_or_else(|| QueueError::StorageFull("head key-space exhausted".to_string()))?;
        self.head = key;
        Ok(key)
    }

    /// Consume the head slot, if any, for `drop_first`/`peek_first`.
    pub fn head_key(&self) -> Option<u64> {
        if self.is_empty() {
            None
        } else {
            Some(self.head)
        }
    }

    pub fn advance_head(&mut self) {
        if !self.is_empty() {
            self.head += 1;
        }
    }

    /// Recompute `head`/`tail` from the smallest and largest extant
    /// positions found during a startup scan, per spec §4.A.
    pub fn recover(mut positions: Vec<u64>) -> Self {
        positions.sort_unstable();
        match (positions.first(), positions.last()) {
            (Some(&min), Some(&max)) => Self {
                head: min,
                tail: max + 1,
            },
            _ => Self::default(),
        }
    }
}

/// Minimal storage primitive both backends implement; the `map`/`retain`
/// algorithms below are written once against this trait.
#[async_trait]
pub trait EntryStore: Send + Sync {
    async fn read(&self, key: u64) -> Result<Option<QueueEntry>>;
    async fn write(&self, key: u64, entry: &QueueEntry) -> Result<()>;
    async fn remove(&self, key: u64) -> Result<()>;
}

/// Rewrite every entry in `[keyspace.head, keyspace.tail)` through `f`.
/// Preserves count and relative order (`f` only touches payload bytes).
pub async fn apply_map(
    store: &dyn EntryStore,
    keyspace: &KeySpace,
    f: &(dyn Fn(Request) -> Request + Send + Sync),
) -> Result<()> {
    let mut key = keyspace.head;
    while key < keyspace.tail {
        if let Some(mut entry) = store.read(key).await? {
            entry.request = f(entry.request);
            store.write(key, &entry).await?;
        }
        key += 1;
    }
    Ok(())
}

/// Two-pointer compaction: walk `[head, tail)`, keep entries the predicate
/// accepts, and pack them into a dense prefix starting at `head`. Preserves
/// relative order of the kept entries. `keyspace.tail` shrinks to reflect
/// the new dense range; `keyspace.head` is unchanged.
pub async fn apply_retain(
    store: &dyn EntryStore,
    keyspace: &mut KeySpace,
    predicate: &(dyn Fn(&Request) -> bool + Send + Sync),
) -> Result<()> {
    let mut write_key = keyspace.head;
    let mut read_key = keyspace.head;
    while read_key < keyspace.tail {
        if let Some(mut entry) = store.read(read_key).await? {
            if predicate(&entry.request) {
                if write_key != read_key {
                    entry.position = write_key;
                    store.write(write_key, &entry).await?;
                    store.remove(read_key).await?;
                }
                write_key += 1;
            } else {
                store.remove(read_key).await?;
            }
        }
        read_key += 1;
    }
    keyspace.tail = write_key;
    Ok(())
}
