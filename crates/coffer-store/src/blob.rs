//! Kinds of objects kept by a content store.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Deduplicated blob kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlobKind {
    /// A chunk of file content.
    Data,
    /// A serialized directory tree.
    Tree,
}

impl BlobKind {
    /// Directory name used by on-disk backends.
    pub fn dir_name(&self) -> &'static str {
        match self {
            BlobKind::Data => "data",
            BlobKind::Tree => "trees",
        }
    }
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobKind::Data => f.write_str("data"),
            BlobKind::Tree => f.write_str("tree"),
        }
    }
}

/// Objects stored one-per-file, outside the blob index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnpackedKind {
    /// Snapshot records.
    Snapshot,
    /// Persisted blob index.
    Index,
}

impl UnpackedKind {
    /// Directory name used by on-disk backends.
    pub fn dir_name(&self) -> &'static str {
        match self {
            UnpackedKind::Snapshot => "snapshots",
            UnpackedKind::Index => "index",
        }
    }
}

impl fmt::Display for UnpackedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnpackedKind::Snapshot => f.write_str("snapshot"),
            UnpackedKind::Index => f.write_str("index"),
        }
    }
}
