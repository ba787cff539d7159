//! Replays a stored snapshot tree in walk order.

use std::path::PathBuf;
use std::sync::Arc;

use coffer_store::{ContentId, ContentStore};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ArchiveResult;
use crate::job::forward;
use crate::node::Node;
use crate::store_ext::StoreExt;

/// Streams `(path, node)` pairs of a stored tree: each directory after its
/// subtree, the top-level directory (empty path) last.
pub struct PriorTreeWalker {
    store: Arc<dyn ContentStore>,
    tree: ContentId,
}

impl PriorTreeWalker {
    /// Walker over the tree rooted at `tree`.
    pub fn new(store: Arc<dyn ContentStore>, tree: ContentId) -> Self {
        Self { store, tree }
    }

    /// Send every node to `tx`; `node.path` holds the archive path.
    /// A tree that cannot be loaded is fatal.
    pub async fn walk(
        self,
        tx: mpsc::Sender<Node>,
        cancel: CancellationToken,
    ) -> ArchiveResult<()> {
        let count = walk_tree(&self.store, self.tree, PathBuf::new(), &tx, &cancel).await?;
        forward(&tx, Node::root(self.tree), &cancel).await?;
        debug!(tree = %self.tree.short(), nodes = count, "prior tree walk finished");
        Ok(())
    }
}

fn walk_tree<'a>(
    store: &'a Arc<dyn ContentStore>,
    id: ContentId,
    prefix: PathBuf,
    tx: &'a mpsc::Sender<Node>,
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, ArchiveResult<u64>> {
    async move {
        let tree = store.load_tree(&id).await?;
        let mut count = 0;
        for mut node in tree.nodes {
            let path = prefix.join(&node.name);
            if let (true, Some(subtree)) = (node.is_dir(), node.subtree) {
                count += walk_tree(store, subtree, path.clone(), tx, cancel).await?;
            }
            node.path = path;
            count += 1;
            forward(tx, node, cancel).await?;
        }
        Ok(count)
    }
    .boxed()
}
