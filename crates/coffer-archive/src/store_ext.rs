//! Tree and snapshot persistence on top of any [`ContentStore`].

use async_trait::async_trait;
use bytes::Bytes;
use coffer_store::{BlobKind, ContentId, ContentStore, UnpackedKind};
use tracing::{debug, warn};

use crate::error::ArchiveResult;
use crate::snapshot::Snapshot;
use crate::tree::Tree;

/// Typed objects stored through a [`ContentStore`].
#[async_trait]
pub trait StoreExt {
    /// Store a tree unless an identical one exists; returns its ID.
    async fn save_tree(&self, tree: &Tree) -> ArchiveResult<ContentId>;

    /// Load a tree.
    async fn load_tree(&self, id: &ContentId) -> ArchiveResult<Tree>;

    /// Store a snapshot record; returns its ID.
    async fn save_snapshot(&self, snapshot: &Snapshot) -> ArchiveResult<ContentId>;

    /// Load a snapshot record, filling in its ID.
    async fn load_snapshot(&self, id: &ContentId) -> ArchiveResult<Snapshot>;

    /// All snapshots, oldest first.
    async fn list_snapshots(&self) -> ArchiveResult<Vec<Snapshot>>;

    /// Most recent snapshot over exactly `paths`.
    async fn latest_snapshot(&self, paths: &[String]) -> ArchiveResult<Option<Snapshot>>;
}

#[async_trait]
impl<S: ContentStore + ?Sized> StoreExt for S {
    async fn save_tree(&self, tree: &Tree) -> ArchiveResult<ContentId> {
        let data = tree.encode()?;
        let id = ContentId::hash(&data);
        if self.exists(&id).await? {
            debug!(id = %id.short(), "tree already stored");
            return Ok(id);
        }
        let length = data.len() as u64;
        self.save(BlobKind::Tree, id, length, Bytes::from(data))
            .await?;
        debug!(id = %id.short(), nodes = tree.len(), "saved tree");
        Ok(id)
    }

    async fn load_tree(&self, id: &ContentId) -> ArchiveResult<Tree> {
        let data = self.load(BlobKind::Tree, id).await?;
        Tree::decode(&data)
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> ArchiveResult<ContentId> {
        let data = serde_json::to_vec(snapshot)?;
        Ok(self
            .save_unpacked(UnpackedKind::Snapshot, Bytes::from(data))
            .await?)
    }

    async fn load_snapshot(&self, id: &ContentId) -> ArchiveResult<Snapshot> {
        let data = self.load_unpacked(UnpackedKind::Snapshot, id).await?;
        let mut snapshot: Snapshot = serde_json::from_slice(&data)?;
        snapshot.id = Some(*id);
        Ok(snapshot)
    }

    async fn list_snapshots(&self) -> ArchiveResult<Vec<Snapshot>> {
        let mut snapshots = Vec::new();
        for id in self.list_unpacked(UnpackedKind::Snapshot).await? {
            match self.load_snapshot(&id).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(id = %id.short(), error = %e, "skipping unreadable snapshot"),
            }
        }
        snapshots.sort_by(|a, b| a.time.cmp(&b.time));
        Ok(snapshots)
    }

    async fn latest_snapshot(&self, paths: &[String]) -> ArchiveResult<Option<Snapshot>> {
        Ok(self
            .list_snapshots()
            .await?
            .into_iter()
            .filter(|s| s.has_paths(paths))
            .max_by(|a, b| a.time.cmp(&b.time)))
    }
}
