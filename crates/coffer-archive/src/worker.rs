//! Entry workers: turn file jobs into content-addressed nodes and directory
//! jobs into stored trees.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use coffer_store::{BlobKind, ContentId, ContentStore};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chunker::{ChunkStream, Chunker};
use crate::error::{ArchiveError, ArchiveResult};
use crate::job::{DirJob, FileJob, ResultReceiver};
use crate::node::{EntryInfo, Node, NodeKind};
use crate::progress::Reporter;
use crate::saver::BlobSaver;
use crate::store_ext::StoreExt;
use crate::tree::Tree;

type SharedQueue<T> = Arc<Mutex<mpsc::Receiver<T>>>;
type PendingSave = JoinHandle<ArchiveResult<(ContentId, u64)>>;

/// Wait until no save of `pending` is running anymore, aborting them first
/// when the run is being cancelled. Returns the first store failure among
/// the saves that ran to completion.
async fn settle(
    pending: impl IntoIterator<Item = PendingSave>,
    abort: bool,
) -> Option<ArchiveError> {
    let mut failure = None;
    for handle in pending {
        if abort {
            handle.abort();
        }
        match handle.await {
            Ok(Err(e)) if failure.is_none() => failure = Some(e),
            Err(e) if failure.is_none() && !e.is_cancelled() => failure = Some(e.into()),
            _ => {}
        }
    }
    failure
}

/// Resources shared by every worker of a run.
#[derive(Clone)]
pub struct WorkerContext {
    /// Target store
    pub store: Arc<dyn ContentStore>,
    /// Bounded chunk saver
    pub saver: Arc<BlobSaver>,
    /// Chunk producer
    pub chunker: Arc<dyn Chunker>,
    /// Error and progress sink
    pub reporter: Reporter,
    /// Run cancellation
    pub cancel: CancellationToken,
}

/// Fixed pool of file and directory workers.
pub struct EntryWorkerPool {
    ctx: WorkerContext,
    file_workers: usize,
    dir_workers: usize,
}

impl EntryWorkerPool {
    /// Pool with the given worker counts (at least one of each).
    pub fn new(ctx: WorkerContext, file_workers: usize, dir_workers: usize) -> Self {
        Self {
            ctx,
            file_workers: file_workers.max(1),
            dir_workers: dir_workers.max(1),
        }
    }

    /// Spawn the workers into `tasks`. They exit once their queue is closed
    /// and drained, on cancellation, or with the first fatal error.
    pub fn spawn(
        self,
        files: mpsc::Receiver<FileJob>,
        dirs: mpsc::Receiver<DirJob>,
        tasks: &mut JoinSet<ArchiveResult<()>>,
    ) {
        let files = Arc::new(Mutex::new(files));
        let dirs = Arc::new(Mutex::new(dirs));
        for _ in 0..self.file_workers {
            tasks.spawn(file_worker(self.ctx.clone(), files.clone()));
        }
        for _ in 0..self.dir_workers {
            tasks.spawn(dir_worker(self.ctx.clone(), dirs.clone()));
        }
    }
}

async fn next_job<T>(
    queue: &SharedQueue<T>,
    cancel: &CancellationToken,
) -> ArchiveResult<Option<T>> {
    let mut rx = tokio::select! {
        _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
        rx = queue.lock() => rx,
    };
    tokio::select! {
        _ = cancel.cancelled() => Err(ArchiveError::Cancelled),
        job = rx.recv() => Ok(job),
    }
}

async fn file_worker(ctx: WorkerContext, queue: SharedQueue<FileJob>) -> ArchiveResult<()> {
    while let Some(job) = next_job(&queue, &ctx.cancel).await? {
        let FileJob {
            path,
            source,
            info,
            prior,
            result,
        } = job;
        match ctx.process_file(&path, &source, info, prior).await {
            Ok(node) => {
                ctx.reporter.progress().file_done();
                let _ = result.send(Some(node));
            }
            Err(e) if !e.is_fatal() => {
                ctx.reporter.report(&path, &e)?;
                let _ = result.send(None);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn dir_worker(ctx: WorkerContext, queue: SharedQueue<DirJob>) -> ArchiveResult<()> {
    while let Some(job) = next_job(&queue, &ctx.cancel).await? {
        let DirJob {
            path,
            info,
            children,
            error,
            result,
        } = job;
        let node = ctx.process_dir(&path, &info, children, error).await?;
        ctx.reporter.progress().dir_done();
        let _ = result.send(Some(node));
    }
    Ok(())
}

impl WorkerContext {
    /// Build the node of a non-directory entry.
    pub async fn process_file(
        &self,
        path: &Path,
        source: &Path,
        info: EntryInfo,
        prior: Option<Node>,
    ) -> ArchiveResult<Node> {
        if info.kind != NodeKind::File {
            return Ok(Node::from_info(path, &info));
        }
        if let Some(node) = prior {
            if self.all_stored(&node.content).await? {
                debug!(path = %path.display(), chunks = node.content.len(), "reusing prior content");
                self.reporter.progress().add_bytes(node.size);
                self.reporter.progress().file_reused();
                return Ok(node);
            }
            debug!(path = %path.display(), "prior content incomplete, reading file");
        }
        self.save_file(path, source, info).await
    }

    async fn all_stored(&self, content: &[ContentId]) -> ArchiveResult<bool> {
        for id in content {
            if !self.store.exists(id).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn save_file(&self, path: &Path, source: &Path, info: EntryInfo) -> ArchiveResult<Node> {
        let file = tokio::fs::File::open(source)
            .await
            .map_err(|e| ArchiveError::io(path, e))?;
        let meta = file.metadata().await.map_err(|e| ArchiveError::io(path, e))?;
        let mut info = info;
        let current = EntryInfo::from_metadata(&meta);
        if !current.same_version(&info) {
            self.reporter
                .report(path, &ArchiveError::FileChanged { path: path.to_path_buf() })?;
            info = current;
        }

        let mut chunks = self.chunker.chunk(Box::new(file.into_std().await));
        let mut pending = Vec::new();
        if let Err(e) = self.queue_saves(path, &mut chunks, &mut pending).await {
            let cancelled = matches!(e, ArchiveError::Cancelled);
            return Err(settle(pending, cancelled).await.unwrap_or(e));
        }

        // chunk order, not completion order
        let mut content = Vec::with_capacity(pending.len());
        let mut saved = 0u64;
        let mut pending = pending.into_iter();
        while let Some(mut handle) = pending.next() {
            let res = tokio::select! {
                _ = self.cancel.cancelled() => Err(ArchiveError::Cancelled),
                res = &mut handle => res.map_err(ArchiveError::from).and_then(|r| r),
            };
            let (id, length) = match res {
                Ok(done) => done,
                Err(e) => {
                    let cancelled = matches!(e, ArchiveError::Cancelled);
                    settle(std::iter::once(handle).chain(pending), cancelled).await;
                    return Err(e);
                }
            };
            self.reporter.progress().add_bytes(length);
            content.push(id);
            saved += length;
        }
        if saved != info.size {
            return Err(ArchiveError::SizeMismatch {
                path: path.to_path_buf(),
                saved,
                expected: info.size,
            });
        }
        debug!(path = %path.display(), chunks = content.len(), bytes = saved, "saved file");
        Ok(Node::from_info(path, &info).with_content(content))
    }

    /// Start a save for every chunk of the stream, each under its own permit.
    async fn queue_saves(
        &self,
        path: &Path,
        chunks: &mut ChunkStream,
        pending: &mut Vec<PendingSave>,
    ) -> ArchiveResult<()> {
        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return Err(ArchiveError::Cancelled),
                chunk = chunks.next() => chunk,
            };
            let Some(chunk) = chunk else { return Ok(()) };
            let chunk = chunk.map_err(|e| ArchiveError::io(path, e))?;
            let permit = self.saver.acquire(&self.cancel).await?;
            let saver = self.saver.clone();
            pending.push(tokio::spawn(async move {
                saver.save_with_permit(permit, BlobKind::Data, chunk).await
            }));
        }
    }

    /// Wait for all children, then store the directory's tree.
    pub async fn process_dir(
        &self,
        path: &Path,
        info: &EntryInfo,
        children: Vec<ResultReceiver>,
        error: Option<String>,
    ) -> ArchiveResult<Node> {
        let mut nodes = Vec::with_capacity(children.len());
        for child in children {
            let res = tokio::select! {
                _ = self.cancel.cancelled() => return Err(ArchiveError::Cancelled),
                res = child => res,
            };
            // Err: the producing task went away, which only happens on abort
            if let Ok(Some(node)) = res {
                nodes.push(node);
            }
        }
        let tree = Tree::new(nodes);
        let id = self.store.save_tree(&tree).await?;
        let mut node = Node::from_info(path, info);
        node.subtree = Some(id);
        if let Some(reason) = error {
            self.reporter.report(
                path,
                &ArchiveError::ReadDir {
                    path: PathBuf::from(path),
                    reason: reason.clone(),
                },
            )?;
            node.error = Some(reason);
        }
        debug!(path = %path.display(), tree = %id.short(), children = tree.len(), "saved directory");
        Ok(node)
    }
}
