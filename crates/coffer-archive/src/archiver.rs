//! Snapshot builder: drives one archiving run end to end.
//!
//! ```text
//! FilesystemWalker ─┐
//!                   ├─> DiffMerger ─> split ─┬─> file workers ─> BlobSaver ─> store
//! PriorTreeWalker ──┘                        └─> dir workers ──> trees ─────> store
//! ```
//!
//! The run completes when the top-level directory's node arrives; the
//! snapshot record is then saved, the store flushed and its index persisted.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use coffer_store::{ContentId, ContentStore};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::chunker::{Chunker, ChunkerConfig, FastCdcChunker};
use crate::error::{ArchiveError, ArchiveResult};
use crate::job::split_jobs;
use crate::merge::DiffMerger;
use crate::prior::PriorTreeWalker;
use crate::progress::{ErrorCallback, Progress, Reporter, Stat};
use crate::saver::{BlobSaver, SaverStats};
use crate::snapshot::Snapshot;
use crate::store_ext::StoreExt;
use crate::walk::{exclude_names, resolve_roots, EntryFilter, FilesystemWalker};
use crate::worker::{EntryWorkerPool, WorkerContext};

/// Archiver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Concurrent file workers
    pub file_workers: usize,
    /// Concurrent directory workers
    pub dir_workers: usize,
    /// Chunk saves in flight at once
    pub max_concurrent_saves: usize,
    /// Capacity of each pipeline queue
    pub queue_depth: usize,
    /// FastCDC parameters
    pub chunker: ChunkerConfig,
    /// File names excluded from every walk
    pub exclude: Vec<String>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            file_workers: 10,
            dir_workers: 10,
            max_concurrent_saves: 32,
            queue_depth: 64,
            chunker: ChunkerConfig::default(),
            exclude: Vec::new(),
        }
    }
}

impl ArchiveConfig {
    /// Reject zero-sized pools and invalid chunker sizes.
    pub fn validate(&self) -> ArchiveResult<()> {
        for (name, value) in [
            ("file_workers", self.file_workers),
            ("dir_workers", self.dir_workers),
            ("max_concurrent_saves", self.max_concurrent_saves),
            ("queue_depth", self.queue_depth),
        ] {
            if value == 0 {
                return Err(ArchiveError::InvalidConfig(format!("{name} must be > 0")));
            }
        }
        self.chunker.validate()
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// No run started yet
    Idle,
    /// Walkers starting
    Walking,
    /// Jobs flowing through the workers
    Processing,
    /// Saving the snapshot, flushing, persisting the index
    Finalizing,
    /// Last run produced a snapshot
    Done,
    /// Last run failed or was cancelled
    Aborted,
}

/// Parameters of one snapshot.
#[derive(Clone, Default)]
pub struct SnapshotRequest {
    /// Paths to archive
    pub paths: Vec<PathBuf>,
    /// Snapshot to reuse unchanged files from
    pub parent: Option<ContentId>,
    /// Receives every entry error and warning
    pub on_error: Option<ErrorCallback>,
    /// Overrides the configured exclude list
    pub filter: Option<EntryFilter>,
    /// Counters to update, for callers watching the run
    pub progress: Option<Arc<Progress>>,
}

impl SnapshotRequest {
    /// Request archiving `paths`.
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            ..Self::default()
        }
    }

    /// Reuse unchanged files from `parent`.
    pub fn parent(mut self, parent: Option<ContentId>) -> Self {
        self.parent = parent;
        self
    }

    /// Report entry errors to `callback`.
    pub fn on_error(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    /// Walk with a custom filter.
    pub fn filter(mut self, filter: EntryFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Update `progress` while running.
    pub fn progress(mut self, progress: Arc<Progress>) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Result of a finished run.
#[derive(Debug, Clone)]
pub struct SnapshotSummary {
    /// ID of the stored snapshot record
    pub id: ContentId,
    /// The stored record
    pub snapshot: Snapshot,
    /// Entry totals
    pub stats: Stat,
    /// Chunk saver counters
    pub saver: SaverStats,
    /// Files reused from the parent without reading
    pub reused_files: u64,
    /// ID of the persisted index
    pub index_id: ContentId,
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone)]
pub enum SnapshotOutcome {
    /// Snapshot stored
    Completed(Box<SnapshotSummary>),
    /// Stopped before finalizing; no snapshot was stored
    Cancelled,
}

impl SnapshotOutcome {
    /// The summary of a completed run.
    pub fn completed(self) -> Option<SnapshotSummary> {
        match self {
            SnapshotOutcome::Completed(summary) => Some(*summary),
            SnapshotOutcome::Cancelled => None,
        }
    }
}

/// Creates snapshots in a content store.
pub struct Archiver {
    store: Arc<dyn ContentStore>,
    config: ArchiveConfig,
    chunker: Arc<dyn Chunker>,
    stop: CancellationToken,
    state: watch::Sender<RunState>,
}

impl Archiver {
    /// Archiver over `store`; fails on an invalid configuration.
    pub fn new(store: Arc<dyn ContentStore>, config: ArchiveConfig) -> ArchiveResult<Self> {
        config.validate()?;
        let chunker = Arc::new(FastCdcChunker::new(config.chunker.clone()));
        let (state, _) = watch::channel(RunState::Idle);
        Ok(Self {
            store,
            config,
            chunker,
            stop: CancellationToken::new(),
            state,
        })
    }

    /// Replace the FastCDC chunker.
    pub fn with_chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = chunker;
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// The store snapshots are written to
    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Token that cancels the current and every later run.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Cancel the current and every later run.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// State of the latest run
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: RunState) {
        debug!(?state, "archiver state");
        self.state.send_replace(state);
    }

    /// Most recent snapshot over the same roots as `paths`.
    pub async fn find_parent(&self, paths: &[PathBuf]) -> ArchiveResult<Option<Snapshot>> {
        let roots = resolve_roots(paths)?;
        let sources: Vec<String> = roots
            .iter()
            .map(|r| r.source.to_string_lossy().into_owned())
            .collect();
        self.store.latest_snapshot(&sources).await
    }

    /// Snapshot `paths`, reusing unchanged files from `parent`.
    pub async fn create_snapshot(
        &self,
        paths: Vec<PathBuf>,
        parent: Option<ContentId>,
        on_error: Option<ErrorCallback>,
    ) -> ArchiveResult<SnapshotOutcome> {
        let mut request = SnapshotRequest::new(paths).parent(parent);
        request.on_error = on_error;
        self.snapshot(request).await
    }

    /// Run one snapshot.
    pub async fn snapshot(&self, request: SnapshotRequest) -> ArchiveResult<SnapshotOutcome> {
        self.set_state(RunState::Walking);
        let result = self.run(request).await;
        match &result {
            Ok(SnapshotOutcome::Completed(summary)) => {
                info!(
                    id = %summary.id.short(),
                    files = summary.stats.files,
                    dirs = summary.stats.dirs,
                    bytes = summary.stats.bytes,
                    errors = summary.stats.errors,
                    reused = summary.reused_files,
                    chunks_written = summary.saver.written,
                    "snapshot saved"
                );
                self.set_state(RunState::Done);
            }
            Ok(SnapshotOutcome::Cancelled) => {
                info!("snapshot cancelled");
                self.set_state(RunState::Aborted);
            }
            Err(e) => {
                error!(error = %e, "snapshot aborted");
                self.set_state(RunState::Aborted);
            }
        }
        result
    }

    async fn run(&self, request: SnapshotRequest) -> ArchiveResult<SnapshotOutcome> {
        let started = Utc::now();
        let run = self.stop.child_token();
        let roots = resolve_roots(&request.paths)?;
        let paths: Vec<String> = roots
            .iter()
            .map(|r| r.source.to_string_lossy().into_owned())
            .collect();
        let parent_tree = match &request.parent {
            Some(id) => Some(self.store.load_snapshot(id).await?.tree),
            None => None,
        };
        info!(
            roots = roots.len(),
            parent = ?request.parent.map(|p| p.short()),
            "starting snapshot"
        );

        let progress = request.progress.unwrap_or_default();
        let reporter = Reporter::new(progress.clone(), request.on_error);
        let saver = Arc::new(BlobSaver::new(
            self.store.clone(),
            self.config.max_concurrent_saves,
        ));
        let filter = request
            .filter
            .or_else(|| exclude_names(&self.config.exclude));
        let depth = self.config.queue_depth;

        let mut tasks: JoinSet<ArchiveResult<()>> = JoinSet::new();
        let (root_tx, mut root_rx) = oneshot::channel();

        let (live_tx, live_rx) = mpsc::channel(depth);
        let walker = FilesystemWalker::new(roots, filter);
        let cancel = run.clone();
        tasks.spawn_blocking(move || walker.walk(&live_tx, root_tx, &cancel));

        let prior_rx = parent_tree.map(|tree| {
            let (tx, rx) = mpsc::channel(depth);
            let walker = PriorTreeWalker::new(self.store.clone(), tree);
            tasks.spawn(walker.walk(tx, run.clone()));
            rx
        });

        let (merged_tx, merged_rx) = mpsc::channel(depth);
        let merger = DiffMerger::new(prior_rx, live_rx, merged_tx);
        let cancel = run.clone();
        tasks.spawn(async move { merger.run(cancel).await.map(|_| ()) });

        let (file_tx, file_rx) = mpsc::channel(depth);
        let (dir_tx, dir_rx) = mpsc::channel(depth);
        tasks.spawn(split_jobs(
            merged_rx,
            file_tx,
            dir_tx,
            reporter.clone(),
            run.clone(),
        ));

        let ctx = WorkerContext {
            store: self.store.clone(),
            saver: saver.clone(),
            chunker: self.chunker.clone(),
            reporter,
            cancel: run.clone(),
        };
        EntryWorkerPool::new(ctx, self.config.file_workers, self.config.dir_workers)
            .spawn(file_rx, dir_rx, &mut tasks);
        self.set_state(RunState::Processing);

        let mut failure = None;
        let root = loop {
            tokio::select! {
                root = &mut root_rx => break root.ok().flatten(),
                Some(joined) = tasks.join_next() => {
                    if let Err(e) = flatten(joined) {
                        run.cancel();
                        failure = Some(e);
                        break None;
                    }
                }
                _ = run.cancelled() => break None,
            }
        };
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = flatten(joined) {
                run.cancel();
                failure.get_or_insert(e);
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        if run.is_cancelled() {
            return Ok(SnapshotOutcome::Cancelled);
        }
        let tree = root
            .and_then(|node| node.subtree)
            .ok_or(ArchiveError::MissingRoot)?;

        self.set_state(RunState::Finalizing);
        let mut snapshot = Snapshot::new(paths, tree, request.parent, started);
        let id = self.store.save_snapshot(&snapshot).await?;
        snapshot.id = Some(id);
        self.store.flush().await?;
        let index_id = self.store.persist_index().await?;

        Ok(SnapshotOutcome::Completed(Box::new(SnapshotSummary {
            id,
            snapshot,
            stats: progress.stat(),
            saver: saver.stats(),
            reused_files: progress.reused_files(),
            index_id,
        })))
    }
}

/// Task result with cancellation treated as a clean exit.
fn flatten(joined: Result<ArchiveResult<()>, tokio::task::JoinError>) -> ArchiveResult<()> {
    match joined {
        Ok(Err(ArchiveError::Cancelled)) => Ok(()),
        Ok(res) => res,
        Err(e) => Err(e.into()),
    }
}
