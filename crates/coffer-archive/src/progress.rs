//! Run counters and entry error reporting.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ArchiveError, ArchiveResult};

/// Called once for every entry error or warning of a run. Returning `Err`
/// aborts the run; without a callback every entry error is skipped.
pub type ErrorCallback = Arc<dyn Fn(&Path, &ArchiveError) -> ArchiveResult<()> + Send + Sync>;

/// Totals of a run (or of a scan).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Non-directory entries archived. A scan counts regular files only.
    pub files: u64,
    /// Directories
    pub dirs: u64,
    /// Content bytes processed
    pub bytes: u64,
    /// Entries skipped because of errors
    pub errors: u64,
}

impl Stat {
    /// Add another stat into this one.
    pub fn add(&mut self, other: Stat) {
        self.files += other.files;
        self.dirs += other.dirs;
        self.bytes += other.bytes;
        self.errors += other.errors;
    }
}

/// Live counters updated by the workers; share it to watch a run.
#[derive(Debug, Default)]
pub struct Progress {
    files: AtomicU64,
    dirs: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
    reused_files: AtomicU64,
}

impl Progress {
    /// Fresh counters
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn file_done(&self) {
        self.files.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dir_done(&self) {
        self.dirs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn file_reused(&self) {
        self.reused_files.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Current totals
    pub fn stat(&self) -> Stat {
        Stat {
            files: self.files.load(Ordering::Relaxed),
            dirs: self.dirs.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Files taken over from the parent snapshot without reading them
    pub fn reused_files(&self) -> u64 {
        self.reused_files.load(Ordering::Relaxed)
    }
}

/// Routes entry errors to the log, the counters and the caller's callback.
#[derive(Clone)]
pub struct Reporter {
    progress: Arc<Progress>,
    callback: Option<ErrorCallback>,
}

impl Reporter {
    /// Report into `progress`, forwarding to `callback` if given.
    pub fn new(progress: Arc<Progress>, callback: Option<ErrorCallback>) -> Self {
        Self { progress, callback }
    }

    /// Counters of the run
    pub fn progress(&self) -> &Arc<Progress> {
        &self.progress
    }

    /// Report an entry error. Warnings are not counted as errors.
    ///
    /// Fails with [`ArchiveError::Aborted`] when the callback rejects the
    /// error; callers stop the run with it.
    pub fn report(&self, path: &Path, err: &ArchiveError) -> ArchiveResult<()> {
        warn!(path = %path.display(), error = %err, "entry error");
        if !err.is_warning() {
            self.progress.error();
        }
        match &self.callback {
            Some(callback) => callback(path, err).map_err(|e| ArchiveError::Aborted {
                path: path.to_path_buf(),
                source: Box::new(e),
            }),
            None => Ok(()),
        }
    }
}
