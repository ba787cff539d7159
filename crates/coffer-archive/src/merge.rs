//! Merge-join of the prior snapshot tree with the live filesystem walk.
//!
//! Both inputs arrive in walk order. Entries present on both sides become
//! combined jobs; a file whose metadata is unchanged is annotated with the
//! prior node so the worker can skip reading it. Prior entries without a live
//! counterpart are deletions and are dropped.

use std::cmp::Ordering;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ArchiveError, ArchiveResult};
use crate::job::{forward, Job};
use crate::node::{EntryInfo, Node, NodeKind};
use crate::path::{compare_walk_order, merge_step, MergeStep};

/// Whether a live file may take over the content of its prior node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReuseDecision {
    /// Node built from the live metadata and the prior content list
    Reuse(Node),
    /// The file must be read and chunked
    Fresh,
}

/// Decide reuse for a live entry that also exists in the prior tree.
///
/// Only regular files are reused, and only when the kind and size match and
/// the live mtime is not newer than the recorded one.
pub fn decide_reuse(prior: &Node, live: &EntryInfo) -> ReuseDecision {
    if live.kind != NodeKind::File
        || prior.kind != live.kind
        || live.mtime > prior.mtime
        || prior.size != live.size
    {
        return ReuseDecision::Fresh;
    }
    ReuseDecision::Reuse(Node::from_info(&prior.path, live).with_content(prior.content.clone()))
}

/// What a merge did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    /// Paths present on both sides
    pub combined: u64,
    /// Files annotated for reuse
    pub reusable: u64,
    /// Prior entries without a live counterpart
    pub discarded: u64,
    /// Live entries without a prior counterpart
    pub new: u64,
}

/// Tracks strict walk order on one input.
struct OrderCheck {
    side: &'static str,
    last: Option<PathBuf>,
}

impl OrderCheck {
    fn new(side: &'static str) -> Self {
        Self { side, last: None }
    }

    fn accept(&mut self, path: &std::path::Path) -> ArchiveResult<()> {
        if let Some(last) = &self.last {
            if compare_walk_order(last, path) != Ordering::Less {
                return Err(ArchiveError::OutOfOrder {
                    side: self.side,
                    previous: last.clone(),
                    current: path.to_path_buf(),
                });
            }
        }
        self.last = Some(path.to_path_buf());
        Ok(())
    }
}

/// Merges the prior and live streams into one job stream.
pub struct DiffMerger {
    prior: Option<mpsc::Receiver<Node>>,
    live: mpsc::Receiver<Job>,
    out: mpsc::Sender<Job>,
}

impl DiffMerger {
    /// Merge `live` against `prior` (no prior: every entry is new).
    pub fn new(
        prior: Option<mpsc::Receiver<Node>>,
        live: mpsc::Receiver<Job>,
        out: mpsc::Sender<Job>,
    ) -> Self {
        Self { prior, live, out }
    }

    async fn next_prior(
        &mut self,
        check: &mut OrderCheck,
        cancel: &CancellationToken,
    ) -> ArchiveResult<Option<Node>> {
        let Some(prior) = self.prior.as_mut() else {
            return Ok(None);
        };
        let node = tokio::select! {
            _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
            node = prior.recv() => node,
        };
        match node {
            Some(node) => {
                check.accept(&node.path)?;
                Ok(Some(node))
            }
            None => {
                self.prior = None;
                Ok(None)
            }
        }
    }

    /// Next live job. Failed entries are forwarded immediately: they are
    /// never combined and do not take part in the order check.
    async fn next_live(
        &mut self,
        check: &mut OrderCheck,
        stats: &mut MergeStats,
        cancel: &CancellationToken,
    ) -> ArchiveResult<Option<Job>> {
        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
                job = self.live.recv() => job,
            };
            match job {
                Some(job @ Job::Failed(_)) => {
                    stats.new += 1;
                    forward(&self.out, job, cancel).await?;
                }
                Some(job) => {
                    check.accept(job.path())?;
                    return Ok(Some(job));
                }
                None => return Ok(None),
            }
        }
    }

    /// Run the merge to completion. The output is closed on return.
    pub async fn run(mut self, cancel: CancellationToken) -> ArchiveResult<MergeStats> {
        let mut stats = MergeStats::default();
        let mut prior_check = OrderCheck::new("prior");
        let mut live_check = OrderCheck::new("live");
        let mut prior = self.next_prior(&mut prior_check, &cancel).await?;
        let mut live = self.next_live(&mut live_check, &mut stats, &cancel).await?;

        loop {
            match (prior.take(), live.take()) {
                (None, None) => break,
                (Some(node), None) => {
                    debug!(path = %node.path.display(), "removed since parent snapshot");
                    stats.discarded += 1;
                    prior = self.next_prior(&mut prior_check, &cancel).await?;
                }
                (None, Some(job)) => {
                    stats.new += 1;
                    forward(&self.out, job, &cancel).await?;
                    live = self.next_live(&mut live_check, &mut stats, &cancel).await?;
                }
                (Some(node), Some(job)) => match merge_step(&node.path, job.path()) {
                    MergeStep::Combine => {
                        stats.combined += 1;
                        let job = annotate(job, node, &mut stats);
                        forward(&self.out, job, &cancel).await?;
                        prior = self.next_prior(&mut prior_check, &cancel).await?;
                        live = self.next_live(&mut live_check, &mut stats, &cancel).await?;
                    }
                    MergeStep::DiscardPrior => {
                        debug!(path = %node.path.display(), "removed since parent snapshot");
                        stats.discarded += 1;
                        live = Some(job);
                        prior = self.next_prior(&mut prior_check, &cancel).await?;
                    }
                    MergeStep::EmitLive => {
                        stats.new += 1;
                        forward(&self.out, job, &cancel).await?;
                        prior = Some(node);
                        live = self.next_live(&mut live_check, &mut stats, &cancel).await?;
                    }
                },
            }
        }
        debug!(
            combined = stats.combined,
            reusable = stats.reusable,
            discarded = stats.discarded,
            new = stats.new,
            "merge finished"
        );
        Ok(stats)
    }
}

fn annotate(job: Job, prior: Node, stats: &mut MergeStats) -> Job {
    match job {
        Job::File(mut file) => {
            match decide_reuse(&prior, &file.info) {
                ReuseDecision::Reuse(node) => {
                    stats.reusable += 1;
                    file.prior = Some(node);
                }
                ReuseDecision::Fresh => {
                    debug!(path = %file.path.display(), "changed since parent snapshot");
                }
            }
            Job::File(file)
        }
        // directories are always rebuilt from their live children
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{DirJob, FileJob};
    use chrono::Duration;
    use coffer_store::ContentId;
    use std::path::Path;
    use tokio::sync::oneshot;

    fn info(kind: NodeKind, size: u64) -> EntryInfo {
        EntryInfo {
            kind,
            size,
            ..EntryInfo::virtual_root()
        }
    }

    fn prior_file(path: &str, size: u64) -> Node {
        Node::from_info(Path::new(path), &info(NodeKind::File, size))
            .with_content(vec![ContentId::hash(path.as_bytes())])
    }

    fn live_file(path: &str, size: u64) -> Job {
        let (tx, _) = oneshot::channel();
        Job::File(FileJob {
            path: path.into(),
            source: path.into(),
            info: info(NodeKind::File, size),
            prior: None,
            result: tx,
        })
    }

    fn live_dir(path: &str) -> Job {
        let (tx, _) = oneshot::channel();
        Job::Dir(DirJob {
            path: path.into(),
            info: info(NodeKind::Dir, 0),
            children: Vec::new(),
            error: None,
            result: tx,
        })
    }

    async fn merge(prior: Vec<Node>, live: Vec<Job>) -> ArchiveResult<(Vec<Job>, MergeStats)> {
        let (prior_tx, prior_rx) = mpsc::channel(prior.len().max(1));
        for node in prior {
            prior_tx.send(node).await.unwrap();
        }
        drop(prior_tx);
        let (live_tx, live_rx) = mpsc::channel(live.len().max(1));
        for job in live {
            live_tx.send(job).await.unwrap();
        }
        drop(live_tx);
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let stats = DiffMerger::new(Some(prior_rx), live_rx, out_tx)
            .run(CancellationToken::new())
            .await?;
        let mut out = Vec::new();
        while let Some(job) = out_rx.recv().await {
            out.push(job);
        }
        Ok((out, stats))
    }

    fn reused(job: &Job) -> bool {
        matches!(job, Job::File(FileJob { prior: Some(_), .. }))
    }

    #[test]
    fn reuse_decisions() {
        let prior = prior_file("a", 5);
        assert!(matches!(
            decide_reuse(&prior, &info(NodeKind::File, 5)),
            ReuseDecision::Reuse(ref n) if n.content == prior.content
        ));
        assert_eq!(decide_reuse(&prior, &info(NodeKind::File, 6)), ReuseDecision::Fresh);
        assert_eq!(decide_reuse(&prior, &info(NodeKind::Dir, 5)), ReuseDecision::Fresh);
        let mut newer = info(NodeKind::File, 5);
        newer.mtime = newer.mtime + Duration::seconds(1);
        assert_eq!(decide_reuse(&prior, &newer), ReuseDecision::Fresh);
        let mut older = info(NodeKind::File, 5);
        older.mtime = older.mtime - Duration::seconds(1);
        match decide_reuse(&prior, &older) {
            ReuseDecision::Reuse(node) => assert_eq!(node.mtime, older.mtime),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn reuses_unchanged_and_drops_deleted() {
        let prior = vec![
            prior_file("a", 1),
            prior_file("b/x", 1),
            Node::from_info(Path::new("b"), &info(NodeKind::Dir, 0)),
            prior_file("c", 1),
        ];
        let live = vec![
            live_file("a", 1),
            live_file("b/y", 1),
            live_dir("b"),
            live_file("c", 1),
        ];
        let (out, stats) = merge(prior, live).await.unwrap();
        let paths: Vec<_> = out.iter().map(|j| j.path().to_path_buf()).collect();
        assert_eq!(paths, vec![Path::new("a"), Path::new("b/y"), Path::new("b"), Path::new("c")]);
        assert!(reused(&out[0]));
        assert!(!reused(&out[1]));
        assert!(reused(&out[3]));
        assert_eq!(
            stats,
            MergeStats {
                combined: 3,
                reusable: 2,
                discarded: 1,
                new: 1
            }
        );
    }

    #[tokio::test]
    async fn new_directories_and_trailing_deletions() {
        let prior = vec![prior_file("a", 1), prior_file("z/old", 1)];
        let live = vec![live_file("a", 1), live_file("m/new", 1), live_dir("m")];
        let (out, stats) = merge(prior, live).await.unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.new, 2);
    }

    #[tokio::test]
    async fn failed_live_entries_pass_through() {
        let (tx, _) = oneshot::channel();
        let failed = Job::Failed(crate::job::FailedJob {
            path: "a".into(),
            error: ArchiveError::io("a", std::io::Error::other("gone")),
            result: tx,
        });
        let (out, _) = merge(vec![prior_file("a", 1)], vec![failed, live_file("b", 1)])
            .await
            .unwrap();
        assert!(matches!(out[0], Job::Failed(_)));
        assert_eq!(out[1].path(), Path::new("b"));
    }

    #[tokio::test]
    async fn out_of_order_input_is_fatal() {
        let err = merge(Vec::new(), vec![live_file("b", 1), live_file("a", 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::OutOfOrder { side: "live", .. }));

        let err = merge(vec![prior_file("a", 1), prior_file("a", 1)], Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::OutOfOrder { side: "prior", .. }));
    }

    #[tokio::test]
    async fn no_prior_emits_everything() {
        let (live_tx, live_rx) = mpsc::channel(4);
        live_tx.send(live_file("a", 1)).await.unwrap();
        live_tx.send(live_dir("")).await.unwrap();
        drop(live_tx);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let stats = DiffMerger::new(None, live_rx, out_tx)
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.new, 2);
        assert!(out_rx.recv().await.is_some());
        assert!(out_rx.recv().await.is_some());
        assert!(out_rx.recv().await.is_none());
    }
}
