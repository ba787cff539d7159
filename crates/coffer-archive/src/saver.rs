//! Bounded, deduplicating blob saver.
//!
//! Every chunk write holds one permit from a fixed pool, so at most
//! `capacity` writes are in flight no matter how many files are processed
//! concurrently. Each content ID is claimed in-process before the store's
//! existence check, so identical chunks seen concurrently in one run are
//! written once. A save returns only once the chunk is known to be stored,
//! whether this call wrote it or waited for another one that did.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use coffer_store::{BlobKind, ContentId, ContentStore};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chunker::Chunk;
use crate::error::{ArchiveError, ArchiveResult};

/// Counters of a [`BlobSaver`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaverStats {
    /// Chunks written to the store
    pub written: u64,
    /// Chunks skipped because they were already stored or written by another save
    pub deduplicated: u64,
    /// Bytes written to the store
    pub bytes_written: u64,
    /// Highest number of saves holding a permit at once
    pub peak_in_flight: u64,
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    deduplicated: AtomicU64,
    bytes_written: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
}

struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Wraps a [`ContentStore`] with a permit pool and a dedup gate.
pub struct BlobSaver {
    store: Arc<dyn ContentStore>,
    permits: Arc<Semaphore>,
    capacity: usize,
    claimed: DashMap<ContentId, Arc<OnceCell<()>>>,
    counters: Counters,
}

impl BlobSaver {
    /// Create a saver allowing `capacity` concurrent writes.
    pub fn new(store: Arc<dyn ContentStore>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            store,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            claimed: DashMap::new(),
            counters: Counters::default(),
        }
    }

    /// Size of the permit pool
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for a permit, giving up when `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> ArchiveResult<OwnedSemaphorePermit> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ArchiveError::Cancelled),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| ArchiveError::Cancelled)
            }
        }
    }

    /// Save a chunk, acquiring a permit first. Returns its ID and length.
    pub async fn save(
        &self,
        kind: BlobKind,
        chunk: Chunk,
        cancel: &CancellationToken,
    ) -> ArchiveResult<(ContentId, u64)> {
        let permit = self.acquire(cancel).await?;
        self.save_with_permit(permit, kind, chunk).await
    }

    /// Save a chunk under a permit obtained from [`BlobSaver::acquire`].
    /// The permit is released when the save completes.
    pub async fn save_with_permit(
        &self,
        permit: OwnedSemaphorePermit,
        kind: BlobKind,
        chunk: Chunk,
    ) -> ArchiveResult<(ContentId, u64)> {
        let _permit = permit;
        let _in_flight = InFlight::enter(&self.counters);
        let Chunk { data, id, length } = chunk;

        // The first caller for an ID performs the write; later callers wait
        // for its outcome. A failed or abandoned write leaves the cell empty
        // and the next waiter retries it.
        let claim = self.claimed.entry(id).or_default().clone();
        let wrote = AtomicBool::new(false);
        claim
            .get_or_try_init(|| async {
                if self.store.exists(&id).await? {
                    debug!(id = %id.short(), "chunk already stored");
                    return Ok(());
                }
                self.store.save(kind, id, length, data).await?;
                wrote.store(true, Ordering::Relaxed);
                Ok::<_, ArchiveError>(())
            })
            .await?;

        if wrote.load(Ordering::Relaxed) {
            self.counters.written.fetch_add(1, Ordering::Relaxed);
            self.counters
                .bytes_written
                .fetch_add(length, Ordering::Relaxed);
        } else {
            self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
        }
        Ok((id, length))
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> SaverStats {
        let c = &self.counters;
        SaverStats {
            written: c.written.load(Ordering::Relaxed),
            deduplicated: c.deduplicated.load(Ordering::Relaxed),
            bytes_written: c.bytes_written.load(Ordering::Relaxed),
            peak_in_flight: c.peak_in_flight.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use coffer_store::{MemoryStore, StoreError};
    use std::time::Duration;

    fn chunk(data: &'static [u8]) -> Chunk {
        Chunk::new(Bytes::from_static(data))
    }

    #[tokio::test]
    async fn existing_chunks_are_not_rewritten() {
        let store = Arc::new(MemoryStore::new());
        let saver = BlobSaver::new(store.clone(), 4);
        let cancel = CancellationToken::new();
        let (id, len) = saver.save(BlobKind::Data, chunk(b"hello"), &cancel).await.unwrap();
        assert_eq!(id, ContentId::hash(b"hello"));
        assert_eq!(len, 5);

        // a fresh saver has no claims, so the store check decides
        let again = BlobSaver::new(store.clone(), 4);
        again.save(BlobKind::Data, chunk(b"hello"), &cancel).await.unwrap();
        assert_eq!(again.stats().written, 0);
        assert_eq!(again.stats().deduplicated, 1);
        assert_eq!(store.stats().data_writes, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_chunks_write_once() {
        let store = Arc::new(MemoryStore::new().with_write_delay(Duration::from_millis(10)));
        let saver = Arc::new(BlobSaver::new(store.clone(), 8));
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let saver = saver.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                saver.save(BlobKind::Data, chunk(b"same"), &cancel).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.stats().data_writes, 1);
        assert_eq!(saver.stats().written, 1);
        assert_eq!(saver.stats().deduplicated, 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_flight_saves_are_bounded() {
        let store = Arc::new(MemoryStore::new().with_write_delay(Duration::from_millis(5)));
        let saver = Arc::new(BlobSaver::new(store.clone(), 3));
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        for i in 0..40u32 {
            let saver = saver.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let c = Chunk::new(Bytes::from(i.to_le_bytes().to_vec()));
                saver.save(BlobKind::Data, c, &cancel).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(saver.stats().peak_in_flight <= 3);
        assert!(store.stats().peak_data_in_flight <= 3);
        assert_eq!(saver.stats().written, 40);
    }

    #[tokio::test]
    async fn store_failures_propagate_and_release_the_claim() {
        let store = Arc::new(MemoryStore::new());
        let saver = BlobSaver::new(store.clone(), 1);
        let cancel = CancellationToken::new();
        store.set_fail_writes(true);
        let err = saver.save(BlobKind::Data, chunk(b"x"), &cancel).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Store(StoreError::Backend(_))));
        store.set_fail_writes(false);
        saver.save(BlobKind::Data, chunk(b"x"), &cancel).await.unwrap();
        assert_eq!(saver.stats().written, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn claim_hits_wait_for_the_running_write() {
        let store = Arc::new(MemoryStore::new().with_write_delay(Duration::from_millis(200)));
        let saver = Arc::new(BlobSaver::new(store.clone(), 2));
        let cancel = CancellationToken::new();
        let first = {
            let saver = saver.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { saver.save(BlobKind::Data, chunk(b"shared"), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (id, _) = saver.save(BlobKind::Data, chunk(b"shared"), &cancel).await.unwrap();
        // returning means the chunk is stored, not merely claimed
        assert!(store.contains(&id));
        first.await.unwrap().unwrap();
        assert_eq!(saver.stats().written, 1);
        assert_eq!(saver.stats().deduplicated, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_write_is_taken_over() {
        let store = Arc::new(MemoryStore::new().with_write_delay(Duration::from_millis(200)));
        let saver = Arc::new(BlobSaver::new(store.clone(), 2));
        let cancel = CancellationToken::new();
        let first = {
            let saver = saver.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { saver.save(BlobKind::Data, chunk(b"shared"), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let saver = saver.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { saver.save(BlobKind::Data, chunk(b"shared"), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        let (id, _) = second.await.unwrap().unwrap();
        assert!(store.contains(&id));
        assert_eq!(saver.stats().written, 1);
        // the abandoned attempt was started, then the waiter wrote it again
        assert_eq!(store.stats().data_writes, 2);
    }

    #[tokio::test]
    async fn failed_write_is_retried_by_the_next_save() {
        let store = Arc::new(MemoryStore::new());
        let saver = BlobSaver::new(store.clone(), 1);
        let cancel = CancellationToken::new();
        store.set_fail_writes(true);
        assert!(saver.save(BlobKind::Data, chunk(b"x"), &cancel).await.is_err());
        assert!(saver.save(BlobKind::Data, chunk(b"x"), &cancel).await.is_err());
        store.set_fail_writes(false);
        let (id, _) = saver.save(BlobKind::Data, chunk(b"x"), &cancel).await.unwrap();
        assert!(store.contains(&id));
        assert_eq!(saver.stats().deduplicated, 0);
    }

    #[tokio::test]
    async fn acquire_observes_cancellation() {
        let saver = BlobSaver::new(Arc::new(MemoryStore::new()), 1);
        let cancel = CancellationToken::new();
        let _held = saver.acquire(&cancel).await.unwrap();
        cancel.cancel();
        assert!(matches!(saver.acquire(&cancel).await, Err(ArchiveError::Cancelled)));
    }
}
