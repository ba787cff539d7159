//! The content store contract consumed by the archiver.

use async_trait::async_trait;
use bytes::Bytes;

use crate::blob::{BlobKind, UnpackedKind};
use crate::error::StoreResult;
use crate::id::ContentId;

/// Content-addressed storage for blobs, snapshot records and index files.
///
/// Object-safe so the archiver can hold an `Arc<dyn ContentStore>`.
/// Implementations must tolerate concurrent saves of identical content under
/// the same ID.
#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    /// Whether a blob with this ID is already stored (or buffered).
    async fn exists(&self, id: &ContentId) -> StoreResult<bool>;

    /// Store `data` under `id`. `length` must equal `data.len()`.
    async fn save(&self, kind: BlobKind, id: ContentId, length: u64, data: Bytes)
        -> StoreResult<()>;

    /// Load a blob.
    async fn load(&self, kind: BlobKind, id: &ContentId) -> StoreResult<Bytes>;

    /// Store an object outside the blob index; returns the hash of `data`.
    async fn save_unpacked(&self, kind: UnpackedKind, data: Bytes) -> StoreResult<ContentId>;

    /// Load an unpacked object.
    async fn load_unpacked(&self, kind: UnpackedKind, id: &ContentId) -> StoreResult<Bytes>;

    /// IDs of all unpacked objects of a kind.
    async fn list_unpacked(&self, kind: UnpackedKind) -> StoreResult<Vec<ContentId>>;

    /// Make every buffered blob durable.
    async fn flush(&self) -> StoreResult<()>;

    /// Persist the blob index; returns the ID of the written index object.
    async fn persist_index(&self) -> StoreResult<ContentId>;
}
