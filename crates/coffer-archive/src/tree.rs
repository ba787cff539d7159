//! Directory trees and their canonical encoding.

use coffer_store::ContentId;
use serde::{Deserialize, Serialize};

use crate::error::ArchiveResult;
use crate::node::Node;

/// The children of one directory, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    /// Child nodes
    pub nodes: Vec<Node>,
}

impl Tree {
    /// Build a tree, sorting the children by name.
    pub fn new(mut nodes: Vec<Node>) -> Self {
        nodes.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        Self { nodes }
    }

    /// Canonical encoding: JSON followed by a newline.
    pub fn encode(&self) -> ArchiveResult<Vec<u8>> {
        let mut data = serde_json::to_vec(self)?;
        data.push(b'\n');
        Ok(data)
    }

    /// Decode a stored tree.
    pub fn decode(data: &[u8]) -> ArchiveResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Content ID of the encoding.
    pub fn id(&self) -> ArchiveResult<ContentId> {
        Ok(ContentId::hash(&self.encode()?))
    }

    /// Look up a child by name.
    pub fn find(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Number of children
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Is the directory empty?
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
