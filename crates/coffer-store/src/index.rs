//! Blob index: which IDs are durably stored, with their kind and length.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::blob::BlobKind;
use crate::error::StoreResult;
use crate::id::ContentId;

/// Index record for one stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Blob kind.
    pub kind: BlobKind,
    /// Length in bytes.
    pub length: u64,
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    entries: Vec<(ContentId, IndexEntry)>,
}

/// Concurrent index of committed blobs.
#[derive(Debug, Default)]
pub struct Index {
    entries: DashMap<ContentId, IndexEntry>,
}

impl Index {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a blob. Returns true if it was not indexed before.
    pub fn insert(&self, id: ContentId, entry: IndexEntry) -> bool {
        self.entries.insert(id, entry).is_none()
    }

    /// Whether the blob is indexed.
    pub fn contains(&self, id: &ContentId) -> bool {
        self.entries.contains_key(id)
    }

    /// Look up a blob.
    pub fn get(&self, id: &ContentId) -> Option<IndexEntry> {
        self.entries.get(id).map(|e| *e)
    }

    /// Number of indexed blobs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is the index empty?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge every entry of `other` into this index.
    pub fn merge(&self, other: Index) {
        for (id, entry) in other.entries {
            self.entries.insert(id, entry);
        }
    }

    /// Encode the index. Entries are sorted by ID so equal indexes encode
    /// identically.
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        let mut entries: Vec<(ContentId, IndexEntry)> =
            self.entries.iter().map(|e| (*e.key(), *e.value())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(bincode::serialize(&IndexFile { entries })?)
    }

    /// Decode an index written by [`Index::encode`].
    pub fn decode(data: &[u8]) -> StoreResult<Self> {
        let file: IndexFile = bincode::deserialize(data)?;
        let index = Index::new();
        for (id, entry) in file.entries {
            index.insert(id, entry);
        }
        Ok(index)
    }
}
