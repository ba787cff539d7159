//! In-memory content store with write instrumentation.
//!
//! Backs dry runs and the archiver's tests: every write is counted, the
//! number of data writes in flight is tracked (current and peak), and a write
//! delay or write failures can be injected.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::blob::{BlobKind, UnpackedKind};
use crate::error::{StoreError, StoreResult};
use crate::id::ContentId;
use crate::index::{Index, IndexEntry};
use crate::store::ContentStore;

/// Point-in-time copy of the store counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Data blob writes (including duplicates).
    pub data_writes: u64,
    /// Tree blob writes (including duplicates).
    pub tree_writes: u64,
    /// Writes of an ID that was already present.
    pub duplicate_writes: u64,
    /// Bytes handed to `save`.
    pub bytes_written: u64,
    /// Calls to `exists`.
    pub existence_checks: u64,
    /// Calls to `flush`.
    pub flushes: u64,
    /// Calls to `persist_index`.
    pub index_writes: u64,
    /// Highest number of concurrent data writes observed.
    pub peak_data_in_flight: u64,
}

#[derive(Debug, Default)]
struct Counters {
    data_writes: AtomicU64,
    tree_writes: AtomicU64,
    duplicate_writes: AtomicU64,
    bytes_written: AtomicU64,
    existence_checks: AtomicU64,
    flushes: AtomicU64,
    index_writes: AtomicU64,
    data_in_flight: AtomicU64,
    peak_data_in_flight: AtomicU64,
}

/// DashMap-backed content store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: DashMap<ContentId, (BlobKind, Bytes)>,
    unpacked: DashMap<(UnpackedKind, ContentId), Bytes>,
    counters: Counters,
    write_delay: Option<Duration>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `delay` inside every data write, to widen concurrency windows.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Make every subsequent blob write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored blobs of a kind.
    pub fn blob_count(&self, kind: BlobKind) -> usize {
        self.blobs.iter().filter(|e| e.value().0 == kind).count()
    }

    /// Number of stored unpacked objects of a kind.
    pub fn unpacked_count(&self, kind: UnpackedKind) -> usize {
        self.unpacked.iter().filter(|e| e.key().0 == kind).count()
    }

    /// Whether a blob is stored.
    pub fn contains(&self, id: &ContentId) -> bool {
        self.blobs.contains_key(id)
    }

    /// Drop a blob, simulating loss in the backend.
    pub fn remove(&self, id: &ContentId) -> bool {
        self.blobs.remove(id).is_some()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> StoreStats {
        let c = &self.counters;
        StoreStats {
            data_writes: c.data_writes.load(Ordering::Relaxed),
            tree_writes: c.tree_writes.load(Ordering::Relaxed),
            duplicate_writes: c.duplicate_writes.load(Ordering::Relaxed),
            bytes_written: c.bytes_written.load(Ordering::Relaxed),
            existence_checks: c.existence_checks.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
            index_writes: c.index_writes.load(Ordering::Relaxed),
            peak_data_in_flight: c.peak_data_in_flight.load(Ordering::Relaxed),
        }
    }

    async fn write_data(&self, id: ContentId, data: Bytes) {
        let c = &self.counters;
        let now = c.data_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        c.peak_data_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        self.insert(BlobKind::Data, id, data);
        c.data_in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn insert(&self, kind: BlobKind, id: ContentId, data: Bytes) {
        if self.blobs.insert(id, (kind, data)).is_some() {
            self.counters.duplicate_writes.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn exists(&self, id: &ContentId) -> StoreResult<bool> {
        self.counters.existence_checks.fetch_add(1, Ordering::Relaxed);
        Ok(self.blobs.contains_key(id))
    }

    async fn save(
        &self,
        kind: BlobKind,
        id: ContentId,
        length: u64,
        data: Bytes,
    ) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(format!("write of {} rejected", id.short())));
        }
        if data.len() as u64 != length {
            return Err(StoreError::LengthMismatch {
                id,
                expected: length,
                actual: data.len() as u64,
            });
        }
        self.counters.bytes_written.fetch_add(length, Ordering::Relaxed);
        match kind {
            BlobKind::Data => {
                self.counters.data_writes.fetch_add(1, Ordering::Relaxed);
                self.write_data(id, data).await;
            }
            BlobKind::Tree => {
                self.counters.tree_writes.fetch_add(1, Ordering::Relaxed);
                self.insert(kind, id, data);
            }
        }
        debug!(%kind, id = %id.short(), length, "stored blob");
        Ok(())
    }

    async fn load(&self, kind: BlobKind, id: &ContentId) -> StoreResult<Bytes> {
        match self.blobs.get(id) {
            Some(entry) if entry.value().0 == kind => Ok(entry.value().1.clone()),
            _ => Err(StoreError::NotFound { kind, id: *id }),
        }
    }

    async fn save_unpacked(&self, kind: UnpackedKind, data: Bytes) -> StoreResult<ContentId> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(format!("{} write rejected", kind)));
        }
        let id = ContentId::hash(&data);
        self.unpacked.insert((kind, id), data);
        Ok(id)
    }

    async fn load_unpacked(&self, kind: UnpackedKind, id: &ContentId) -> StoreResult<Bytes> {
        self.unpacked
            .get(&(kind, *id))
            .map(|e| e.value().clone())
            .ok_or(StoreError::UnpackedNotFound { kind, id: *id })
    }

    async fn list_unpacked(&self, kind: UnpackedKind) -> StoreResult<Vec<ContentId>> {
        let mut ids: Vec<ContentId> = self
            .unpacked
            .iter()
            .filter(|e| e.key().0 == kind)
            .map(|e| e.key().1)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn flush(&self) -> StoreResult<()> {
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn persist_index(&self) -> StoreResult<ContentId> {
        self.counters.index_writes.fetch_add(1, Ordering::Relaxed);
        let index = Index::new();
        for entry in self.blobs.iter() {
            let (kind, data) = entry.value();
            index.insert(
                *entry.key(),
                IndexEntry {
                    kind: *kind,
                    length: data.len() as u64,
                },
            );
        }
        self.save_unpacked(UnpackedKind::Index, Bytes::from(index.encode()?))
            .await
    }
}
