//! Pipeline jobs and the split into file and directory queues.

use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ArchiveError, ArchiveResult};
use crate::node::{EntryInfo, Node};
use crate::progress::Reporter;

/// Where a job delivers its node; `None` means the entry was skipped.
pub type ResultSender = oneshot::Sender<Option<Node>>;
/// Receiving end of a job's result.
pub type ResultReceiver = oneshot::Receiver<Option<Node>>;

/// A non-directory entry to archive.
#[derive(Debug)]
pub struct FileJob {
    /// Archive path
    pub path: PathBuf,
    /// Location on disk
    pub source: PathBuf,
    /// Metadata captured by the walker
    pub info: EntryInfo,
    /// Node to reuse instead of reading the file
    pub prior: Option<Node>,
    /// Result slot
    pub result: ResultSender,
}

/// A directory, emitted after all of its children.
#[derive(Debug)]
pub struct DirJob {
    /// Archive path
    pub path: PathBuf,
    /// Metadata captured by the walker
    pub info: EntryInfo,
    /// Results of the children, in name order
    pub children: Vec<ResultReceiver>,
    /// Why the directory could not be listed
    pub error: Option<String>,
    /// Result slot
    pub result: ResultSender,
}

/// An entry the walker could not stat.
#[derive(Debug)]
pub struct FailedJob {
    /// Archive path
    pub path: PathBuf,
    /// What went wrong
    pub error: ArchiveError,
    /// Result slot, always answered with `None`
    pub result: ResultSender,
}

/// Unit of pipeline work.
#[derive(Debug)]
pub enum Job {
    /// File, symlink or special file
    File(FileJob),
    /// Directory
    Dir(DirJob),
    /// Entry that failed before it could be classified
    Failed(FailedJob),
}

impl Job {
    /// Archive path of the entry
    pub fn path(&self) -> &Path {
        match self {
            Job::File(job) => &job.path,
            Job::Dir(job) => &job.path,
            Job::Failed(job) => &job.path,
        }
    }
}

/// Send `item`, giving up when `cancel` fires or the receiver is gone.
pub(crate) async fn forward<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    cancel: &CancellationToken,
) -> ArchiveResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ArchiveError::Cancelled),
        sent = tx.send(item) => sent.map_err(|_| ArchiveError::Cancelled),
    }
}

/// Route merged jobs to the file and directory queues. Failed entries are
/// reported and answered here, and end the run if the error callback
/// rejects them. Both queues are closed on return.
pub async fn split_jobs(
    mut jobs: mpsc::Receiver<Job>,
    files: mpsc::Sender<FileJob>,
    dirs: mpsc::Sender<DirJob>,
    reporter: Reporter,
    cancel: CancellationToken,
) -> ArchiveResult<()> {
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
            job = jobs.recv() => job,
        };
        match job {
            None => break,
            Some(Job::File(job)) => forward(&files, job, &cancel).await?,
            Some(Job::Dir(job)) => forward(&dirs, job, &cancel).await?,
            Some(Job::Failed(job)) => {
                reporter.report(&job.path, &job.error)?;
                let _ = job.result.send(None);
            }
        }
    }
    debug!("job split finished");
    Ok(())
}
