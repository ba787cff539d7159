//! Snapshot tree nodes and the live metadata they are built from.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use coffer_store::ContentId;
use serde::{Deserialize, Serialize};

/// Kind of filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Regular file
    File,
    /// Directory
    Dir,
    /// Symbolic link
    Symlink,
    /// Device, socket, FIFO, ...
    Other,
}

/// Metadata of a live filesystem entry, captured by the walker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Entry kind
    pub kind: NodeKind,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub mtime: DateTime<Utc>,
    /// Permission bits (0 where unsupported)
    pub mode: u32,
    /// Target of a symbolic link
    pub link_target: Option<PathBuf>,
}

impl EntryInfo {
    /// Capture metadata obtained with `symlink_metadata` (or from an open handle).
    pub fn from_metadata(meta: &Metadata) -> Self {
        let file_type = meta.file_type();
        let kind = if file_type.is_dir() {
            NodeKind::Dir
        } else if file_type.is_file() {
            NodeKind::File
        } else if file_type.is_symlink() {
            NodeKind::Symlink
        } else {
            NodeKind::Other
        };
        Self {
            kind,
            size: meta.len(),
            mtime: timestamp(meta.modified().unwrap_or(UNIX_EPOCH)),
            mode: mode_bits(meta),
            link_target: None,
        }
    }

    /// Stat `source` without following symlinks, reading the link target if any.
    pub fn stat(source: &Path) -> std::io::Result<Self> {
        let meta = std::fs::symlink_metadata(source)?;
        let mut info = Self::from_metadata(&meta);
        if info.kind == NodeKind::Symlink {
            info.link_target = Some(std::fs::read_link(source)?);
        }
        Ok(info)
    }

    /// Metadata of the synthetic directory holding all snapshot roots.
    pub fn virtual_root() -> Self {
        Self {
            kind: NodeKind::Dir,
            size: 0,
            mtime: timestamp(UNIX_EPOCH),
            mode: 0,
            link_target: None,
        }
    }

    /// Whether `other` describes the same file version (mtime and size).
    pub fn same_version(&self, other: &EntryInfo) -> bool {
        self.mtime == other.mtime && self.size == other.size
    }
}

#[cfg(unix)]
fn mode_bits(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(_meta: &Metadata) -> u32 {
    0
}

/// One entry of a snapshot tree.
///
/// Optional fields are omitted from the encoding when empty so that equal
/// entries always serialize to the same bytes. `path` is the archive path
/// and is never serialized; it is filled in while walking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Final path component
    pub name: String,
    /// Entry kind
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Permission bits
    pub mode: u32,
    /// Modification time
    pub mtime: DateTime<Utc>,
    /// File size (0 for directories)
    pub size: u64,
    /// Content chunks in file order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ContentId>,
    /// Serialized tree of a directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtree: Option<ContentId>,
    /// Symlink target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    /// Error recorded while archiving this entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Archive path
    #[serde(skip)]
    pub path: PathBuf,
}

impl Node {
    /// Build a node for `path` from live metadata, without content.
    pub fn from_info(path: &Path, info: &EntryInfo) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name,
            kind: info.kind,
            mode: info.mode,
            mtime: info.mtime,
            size: if info.kind == NodeKind::Dir { 0 } else { info.size },
            content: Vec::new(),
            subtree: None,
            link_target: info
                .link_target
                .as_ref()
                .map(|t| t.to_string_lossy().into_owned()),
            error: None,
            path: path.to_path_buf(),
        }
    }

    /// The synthetic top-level directory pointing at a snapshot's tree.
    pub fn root(tree: ContentId) -> Self {
        let mut node = Self::from_info(Path::new(""), &EntryInfo::virtual_root());
        node.subtree = Some(tree);
        node
    }

    /// Replace the content list.
    pub fn with_content(mut self, content: Vec<ContentId>) -> Self {
        self.content = content;
        self
    }

    /// Is this a directory?
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }
}

/// Convert a filesystem timestamp the way nodes record it.
pub fn timestamp(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}
