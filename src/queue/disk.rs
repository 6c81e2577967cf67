//! The durable `Storage` backend: one file per `QueueEntry` under
//! `storage_path`, named `<position_decimal>.entry`, written atomically via
//! write-to-temp + rename, per spec §4.A/§6.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::{QueueError, Result};
use crate::queue::keyspace::{self, EntryStore, KeySpace};
use crate::queue::{QueueStats, Storage};
use crate::request::codec::{decode_entry, encode_entry};
use crate::request::types::{QueueEntry, Request};

const VERSION_FILE: &str = ".version";

struct Inner {
    keyspace: KeySpace,
    dir: PathBuf,
}

/// Crash-safe, disk-backed `Storage` implementation.
#[derive(Clone)]
pub struct DiskQueue {
    inner: Arc<Mutex<Inner>>,
}

impl DiskQueue {
    /// Open (or create) the queue directory and recover `head_key`/`tail_key`
    /// from whatever entries are already on disk.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        write_version_file(&dir).await?;

        let positions = scan_recoverable_positions(&dir).await?;
        let keyspace = KeySpace::recover(positions);

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner { keyspace, dir })),
        })
    }

    fn entry_path(dir: &Path, position: u64) -> PathBuf {
        dir.join(format!("{position}.entry"))
    }
}

async fn write_version_file(dir: &Path) -> Result<()> {
    let path = dir.join(VERSION_FILE);
    if !path.exists() {
        fs::write(&path, crate::request::codec::FORMAT_VERSION.to_be_bytes()).await?;
    }
    Ok(())
}

/// Scan `dir` for `<position>.entry` files, deleting any that don't parse as
/// a plain `u64` name or that fail an integrity check, per spec §4.A/§6.
async fn scan_recoverable_positions(dir: &Path) -> Result<Vec<u64>> {
    let mut positions = Vec::new();
    let mut read_dir = fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_suffix(".entry") else {
            continue;
        };
        let Ok(position) = stem.parse::<u64>() else {
            tracing::warn!(file = %name, "deleting queue file with unparseable position");
            let _ = fs::remove_file(&path).await;
            continue;
        };

        match fs::read(&path).await {
            Ok(bytes) => match decode_entry(position, &bytes) {
                Ok(_) => positions.push(position),
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "deleting corrupt queue entry");
                    let _ = fs::remove_file(&path).await;
                }
            },
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "deleting unreadable queue entry");
                let _ = fs::remove_file(&path).await;
            }
        }
    }
    Ok(positions)
}

/// Write `bytes` to `path` atomically: write to a sibling `.tmp` file, flush,
/// then rename over the destination.
async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, bytes).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(())
}

struct DiskEntryStore<'a> {
    dir: &'a Path,
}

#[async_trait]
impl<'a> EntryStore for DiskEntryStore<'a> {
    async fn read(&self, key: u64) -> Result<Option<QueueEntry>> {
        let path = DiskQueue::entry_path(self.dir, key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(decode_entry(key, &bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(QueueError::StorageIO(e)),
        }
    }

    async fn write(&self, key: u64, entry: &QueueEntry) -> Result<()> {
        let path = DiskQueue::entry_path(self.dir, key);
        let bytes = encode_entry(entry)?;
        atomic_write(&path, &bytes).await
    }

    async fn remove(&self, key: u64) -> Result<()> {
        let path = DiskQueue::entry_path(self.dir, key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(QueueError::StorageIO(e)),
        }
    }
}

#[async_trait]
impl Storage for DiskQueue {
    #[tracing::instrument(skip(self, request))]
    async fn append(&self, request: Request) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let key = inner.keyspace.reserve_tail()?;
        let entry = QueueEntry::fresh(key, request);
        let store = DiskEntryStore { dir: &inner.dir };
        if let Err(e) = store.write(key, &entry).await {
            // Roll the reservation back so the slot can be reused.
            inner.keyspace.tail = key;
            return Err(e);
        }
        Ok(key)
    }

    #[tracing::instrument(skip(self, request))]
    async fn prepend(&self, request: Request) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let key = inner.keyspace.reserve_head()?;
        let entry = QueueEntry::fresh(key, request);
        let store = DiskEntryStore { dir: &inner.dir };
        if let Err(e) = store.write(key, &entry).await {
            inner.keyspace.head = key + 1;
            return Err(e);
        }
        Ok(key)
    }

    async fn drop_first(&self) -> Result<Option<QueueEntry>> {
        let mut inner = self.inner.lock().await;
        let Some(head) = inner.keyspace.head_key() else {
            return Ok(None);
        };
        let store = DiskEntryStore { dir: &inner.dir };
        let entry = store.read(head).await?;
        store.remove(head).await?;
        inner.keyspace.advance_head();
        Ok(entry)
    }

    async fn peek_first(&self) -> Result<Option<QueueEntry>> {
        let inner = self.inner.lock().await;
        let Some(head) = inner.keyspace.head_key() else {
            return Ok(None);
        };
        let store = DiskEntryStore { dir: &inner.dir };
        store.read(head).await
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.inner.lock().await.keyspace.len())
    }

    async fn map(&self, f: &(dyn Fn(Request) -> Request + Send + Sync)) -> Result<()> {
        let inner = self.inner.lock().await;
        let store = DiskEntryStore { dir: &inner.dir };
        keyspace::apply_map(&store, &inner.keyspace, f).await
    }

    async fn retain(&self, predicate: &(dyn Fn(&Request) -> bool + Send + Sync)) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let dir = inner.dir.clone();
        let store = DiskEntryStore { dir: &dir };
        let mut keyspace = inner.keyspace;
        keyspace::apply_retain(&store, &mut keyspace, predicate).await?;
        inner.keyspace = keyspace;
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let inner = self.inner.lock().await;
        let store = DiskEntryStore { dir: &inner.dir };
        let oldest = match inner.keyspace.head_key() {
            Some(head) => store
                .read(head)
                .await?
                .map(|e| e.enqueued_at.timestamp_millis()),
            None => None,
        };
        Ok(QueueStats {
            pending: inner.keyspace.len(),
            oldest_enqueued_at_millis: oldest,
        })
    }
}
