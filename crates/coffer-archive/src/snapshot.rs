//! Snapshot records.

use chrono::{DateTime, Utc};
use coffer_store::ContentId;
use serde::{Deserialize, Serialize};

/// A point-in-time pointer to a tree root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// When the run started
    pub time: DateTime<Utc>,
    /// Archived root paths, sorted
    pub paths: Vec<String>,
    /// Snapshot whose tree was used for reuse
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ContentId>,
    /// Top-level tree
    pub tree: ContentId,
    /// Host that took the snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// User that took the snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Assigned once persisted
    #[serde(skip)]
    pub id: Option<ContentId>,
}

impl Snapshot {
    /// New snapshot record stamped with the current host and user.
    pub fn new(
        mut paths: Vec<String>,
        tree: ContentId,
        parent: Option<ContentId>,
        time: DateTime<Utc>,
    ) -> Self {
        paths.sort();
        Self {
            time,
            paths,
            parent,
            tree,
            hostname: hostname(),
            username: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .ok(),
            id: None,
        }
    }

    /// Whether this snapshot covers exactly `paths`.
    pub fn has_paths(&self, paths: &[String]) -> bool {
        let mut wanted = paths.to_vec();
        wanted.sort();
        self.paths == wanted
    }
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}
