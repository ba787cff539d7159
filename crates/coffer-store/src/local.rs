//! Directory-backed content store.
//!
//! Layout under the repository root:
//!
//! ```text
//! data/<xx>/<id>     file chunks      (xx = first byte of the ID in hex)
//! trees/<xx>/<id>    serialized trees
//! snapshots/<id>     snapshot records
//! index/<id>         persisted blob index
//! ```
//!
//! Saved blobs are buffered in memory until [`ContentStore::flush`] (or until
//! the buffer exceeds `pending_limit_bytes`). Every file is written to a
//! temporary name and renamed into place.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::blob::{BlobKind, UnpackedKind};
use crate::error::{StoreError, StoreResult};
use crate::id::ContentId;
use crate::index::{Index, IndexEntry};
use crate::store::ContentStore;

/// Configuration for the local store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalStoreConfig {
    /// Buffered bytes that trigger an automatic flush.
    pub pending_limit_bytes: u64,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            pending_limit_bytes: 64 * 1024 * 1024, // 64MB
        }
    }
}

struct PendingBlob {
    kind: BlobKind,
    data: Bytes,
}

/// Content store rooted at a local directory.
pub struct LocalStore {
    root: PathBuf,
    config: LocalStoreConfig,
    index: Index,
    pending: DashMap<ContentId, PendingBlob>,
    pending_bytes: AtomicU64,
    flush_lock: Mutex<()>,
}

impl LocalStore {
    /// Open (creating if needed) a repository at `root` and load every index
    /// file found in it.
    pub async fn open(root: impl AsRef<Path>, config: LocalStoreConfig) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [
            BlobKind::Data.dir_name(),
            BlobKind::Tree.dir_name(),
            UnpackedKind::Snapshot.dir_name(),
            UnpackedKind::Index.dir_name(),
        ] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }

        let store = Self {
            root,
            config,
            index: Index::new(),
            pending: DashMap::new(),
            pending_bytes: AtomicU64::new(0),
            flush_lock: Mutex::new(()),
        };

        let index_files = store.list_unpacked(UnpackedKind::Index).await?;
        for id in &index_files {
            let data = store.load_unpacked(UnpackedKind::Index, id).await?;
            store.index.merge(Index::decode(&data)?);
        }
        info!(
            root = %store.root.display(),
            index_files = index_files.len(),
            blobs = store.index.len(),
            "opened local store"
        );
        Ok(store)
    }

    /// Repository root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of committed blobs.
    pub fn indexed_blobs(&self) -> usize {
        self.index.len()
    }

    /// Bytes buffered and not yet flushed.
    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes.load(Ordering::SeqCst)
    }

    fn blob_path(&self, kind: BlobKind, id: &ContentId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(kind.dir_name()).join(&hex[..2]).join(hex)
    }

    fn unpacked_path(&self, kind: UnpackedKind, id: &ContentId) -> PathBuf {
        self.root.join(kind.dir_name()).join(id.to_hex())
    }

    async fn read_verified(path: &Path, id: &ContentId) -> StoreResult<Bytes> {
        let data = tokio::fs::read(path).await?;
        let actual = ContentId::hash(&data);
        if actual != *id {
            return Err(StoreError::Corrupt {
                id: *id,
                reason: format!("content hashes to {}", actual.short()),
            });
        }
        Ok(Bytes::from(data))
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn not_found(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::NotFound
}

#[async_trait]
impl ContentStore for LocalStore {
    async fn exists(&self, id: &ContentId) -> StoreResult<bool> {
        Ok(self.index.contains(id) || self.pending.contains_key(id))
    }

    async fn save(
        &self,
        kind: BlobKind,
        id: ContentId,
        length: u64,
        data: Bytes,
    ) -> StoreResult<()> {
        if data.len() as u64 != length {
            return Err(StoreError::LengthMismatch {
                id,
                expected: length,
                actual: data.len() as u64,
            });
        }
        if self.pending.insert(id, PendingBlob { kind, data }).is_none() {
            let buffered = self.pending_bytes.fetch_add(length, Ordering::SeqCst) + length;
            if buffered > self.config.pending_limit_bytes {
                debug!(buffered, "pending limit reached, flushing");
                self.flush().await?;
            }
        }
        Ok(())
    }

    async fn load(&self, kind: BlobKind, id: &ContentId) -> StoreResult<Bytes> {
        if let Some(blob) = self.pending.get(id) {
            if blob.kind == kind {
                return Ok(blob.data.clone());
            }
        }
        match Self::read_verified(&self.blob_path(kind, id), id).await {
            Err(StoreError::IoError(e)) if not_found(&e) => {
                Err(StoreError::NotFound { kind, id: *id })
            }
            other => other,
        }
    }

    async fn save_unpacked(&self, kind: UnpackedKind, data: Bytes) -> StoreResult<ContentId> {
        let id = ContentId::hash(&data);
        write_atomic(&self.unpacked_path(kind, &id), &data).await?;
        debug!(%kind, id = %id.short(), "saved unpacked object");
        Ok(id)
    }

    async fn load_unpacked(&self, kind: UnpackedKind, id: &ContentId) -> StoreResult<Bytes> {
        match Self::read_verified(&self.unpacked_path(kind, id), id).await {
            Err(StoreError::IoError(e)) if not_found(&e) => {
                Err(StoreError::UnpackedNotFound { kind, id: *id })
            }
            other => other,
        }
    }

    async fn list_unpacked(&self, kind: UnpackedKind) -> StoreResult<Vec<ContentId>> {
        let mut ids = Vec::new();
        let mut dir = tokio::fs::read_dir(self.root.join(kind.dir_name())).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            match name.to_str().map(ContentId::from_hex) {
                Some(Ok(id)) => ids.push(id),
                _ => warn!(name = ?name, %kind, "ignoring unexpected file"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn flush(&self) -> StoreResult<()> {
        let _guard = self.flush_lock.lock().await;
        let ids: Vec<ContentId> = self.pending.iter().map(|e| *e.key()).collect();
        let mut written = 0usize;
        for id in ids {
            let Some((kind, data)) = self
                .pending
                .get(&id)
                .map(|blob| (blob.kind, blob.data.clone()))
            else {
                continue;
            };
            let path = self.blob_path(kind, &id);
            write_atomic(&path, &data).await?;
            self.index.insert(
                id,
                IndexEntry {
                    kind,
                    length: data.len() as u64,
                },
            );
            self.pending.remove(&id);
            self.pending_bytes
                .fetch_sub(data.len() as u64, Ordering::SeqCst);
            written += 1;
        }
        debug!(written, "flushed pending blobs");
        Ok(())
    }

    async fn persist_index(&self) -> StoreResult<ContentId> {
        let superseded = self.list_unpacked(UnpackedKind::Index).await?;
        let id = self
            .save_unpacked(UnpackedKind::Index, Bytes::from(self.index.encode()?))
            .await?;
        for old in superseded.into_iter().filter(|old| *old != id) {
            if let Err(e) = tokio::fs::remove_file(self.unpacked_path(UnpackedKind::Index, &old)).await {
                warn!(id = %old.short(), error = %e, "could not remove superseded index");
            }
        }
        info!(id = %id.short(), blobs = self.index.len(), "persisted index");
        Ok(id)
    }
}
