//! Live filesystem walker.
//!
//! Emits one job per entry in walk order (see [`crate::path`]): children
//! sorted by name, each directory after its whole subtree, and finally the
//! synthetic top-level directory holding one entry per root. A directory job
//! carries the result receivers of its children, which were dispatched
//! before it.

use std::collections::HashSet;
use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::error::{ArchiveError, ArchiveResult};
use crate::job::{DirJob, FailedJob, FileJob, Job, ResultReceiver, ResultSender};
use crate::node::{EntryInfo, NodeKind};

/// Predicate over `(source path, metadata)`; entries for which it returns
/// false are skipped together with their subtree.
pub type EntryFilter = Arc<dyn Fn(&Path, &Metadata) -> bool + Send + Sync>;

/// Filter rejecting entries whose file name is in `names`.
pub fn exclude_names(names: &[String]) -> Option<EntryFilter> {
    if names.is_empty() {
        return None;
    }
    let names: HashSet<String> = names.iter().cloned().collect();
    Some(Arc::new(move |path: &Path, _meta: &Metadata| {
        path.file_name()
            .map(|n| !names.contains(n.to_string_lossy().as_ref()))
            .unwrap_or(true)
    }))
}

/// A path to archive, named in the top-level tree by its final component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
    /// Entry name in the top-level tree
    pub name: String,
    /// Canonical location on disk
    pub source: PathBuf,
}

/// Canonicalize root paths and sort them by name.
pub fn resolve_roots(paths: &[PathBuf]) -> ArchiveResult<Vec<Root>> {
    if paths.is_empty() {
        return Err(ArchiveError::NoPaths);
    }
    let mut roots = Vec::with_capacity(paths.len());
    for path in paths {
        let source = fs::canonicalize(path).map_err(|e| ArchiveError::InvalidRoot {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ArchiveError::InvalidRoot {
                path: path.clone(),
                reason: "path has no final component".into(),
            })?;
        roots.push(Root { name, source });
    }
    roots.sort_by(|a, b| a.name.cmp(&b.name));
    for pair in roots.windows(2) {
        if pair[0].name == pair[1].name {
            return Err(ArchiveError::InvalidRoot {
                path: pair[1].source.clone(),
                reason: format!(
                    "name {:?} is already used by {:?}",
                    pair[1].name, pair[0].source
                ),
            });
        }
    }
    Ok(roots)
}

/// Whether `filter` keeps a walkdir entry. Roots are always kept.
pub(crate) fn admits(filter: Option<&EntryFilter>, entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    match (filter, entry.metadata()) {
        (Some(filter), Ok(meta)) => {
            let keep = filter(entry.path(), &meta);
            if !keep {
                debug!(path = %entry.path().display(), "excluded");
            }
            keep
        }
        _ => true,
    }
}

fn lossy_name(entry: &DirEntry) -> String {
    entry.file_name().to_string_lossy().into_owned()
}

/// Walks the roots of one snapshot.
#[derive(Clone)]
pub struct FilesystemWalker {
    roots: Vec<Root>,
    filter: Option<EntryFilter>,
}

impl FilesystemWalker {
    /// Walker over resolved roots.
    pub fn new(roots: Vec<Root>, filter: Option<EntryFilter>) -> Self {
        Self { roots, filter }
    }

    /// The roots, sorted by name
    pub fn roots(&self) -> &[Root] {
        &self.roots
    }

    /// Walk every root, sending jobs to `tx`. The top-level directory job
    /// answers on `root_result`. Blocking: run it on the blocking pool.
    pub fn walk(
        &self,
        tx: &mpsc::Sender<Job>,
        root_result: ResultSender,
        cancel: &CancellationToken,
    ) -> ArchiveResult<()> {
        let mut walk = Walk::new(tx, cancel, root_result);
        let filter = self.filter.as_ref();
        for root in &self.roots {
            // Pre-order, so excluded directories are pruned before their
            // contents are read. Directory jobs are emitted as the walk
            // leaves them, which yields post-order.
            let mut entries = WalkDir::new(&root.source)
                .follow_links(false)
                .sort_by(|a, b| lossy_name(a).cmp(&lossy_name(b)))
                .into_iter()
                .filter_entry(|entry| admits(filter, entry));
            while let Some(next) = entries.next() {
                let entry = match next {
                    Ok(entry) => entry,
                    Err(err) => {
                        walk.unreadable(&root.name, err, filter)?;
                        continue;
                    }
                };
                let name = match entry.depth() {
                    0 => root.name.clone(),
                    _ => lossy_name(&entry),
                };
                let meta = entry.metadata().map_err(io::Error::from);
                let opened = walk.entry(entry.depth(), name, entry.path(), meta, None)?;
                if entry.file_type().is_dir() && !opened {
                    entries.skip_current_dir();
                }
            }
        }
        let entries = walk.finish()?;
        debug!(entries, roots = self.roots.len(), "filesystem walk finished");
        Ok(())
    }
}

/// A directory whose job is sent once the walk has left it.
struct Frame {
    /// Walkdir depth plus one; the top-level directory is level 0
    level: usize,
    path: PathBuf,
    source: PathBuf,
    info: EntryInfo,
    children: Vec<ResultReceiver>,
    last_name: Option<String>,
    error: Option<String>,
    result: ResultSender,
}

struct Walk<'a> {
    tx: &'a mpsc::Sender<Job>,
    cancel: &'a CancellationToken,
    entries: u64,
    open: Vec<Frame>,
}

impl<'a> Walk<'a> {
    fn new(tx: &'a mpsc::Sender<Job>, cancel: &'a CancellationToken, root_result: ResultSender) -> Self {
        let top = Frame {
            level: 0,
            path: PathBuf::new(),
            source: PathBuf::new(),
            info: EntryInfo::virtual_root(),
            children: Vec::new(),
            last_name: None,
            error: None,
            result: root_result,
        };
        Self {
            tx,
            cancel,
            entries: 0,
            open: vec![top],
        }
    }

    fn send(&mut self, job: Job) -> ArchiveResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        self.entries += 1;
        self.tx
            .blocking_send(job)
            .map_err(|_| ArchiveError::Cancelled)
    }

    fn fail(&mut self, path: PathBuf, source: io::Error, result: ResultSender) -> ArchiveResult<()> {
        let error = ArchiveError::io(path.clone(), source);
        self.send(Job::Failed(FailedJob {
            path,
            error,
            result,
        }))
    }

    /// Send the jobs of every open directory at `level` or deeper.
    fn close(&mut self, level: usize) -> ArchiveResult<()> {
        while self.open.last().is_some_and(|frame| frame.level >= level) {
            let Some(frame) = self.open.pop() else { break };
            self.send(Job::Dir(DirJob {
                path: frame.path,
                info: frame.info,
                children: frame.children,
                error: frame.error,
                result: frame.result,
            }))?;
        }
        Ok(())
    }

    /// Close the remaining directories, the top-level one last. Returns the
    /// number of jobs sent.
    fn finish(mut self) -> ArchiveResult<u64> {
        self.close(0)?;
        Ok(self.entries)
    }

    /// Take the entry `name` found at walkdir `depth`. Returns whether a
    /// directory was opened; its children must follow before any sibling.
    fn entry(
        &mut self,
        depth: usize,
        name: String,
        source: &Path,
        meta: io::Result<Metadata>,
        listing_error: Option<String>,
    ) -> ArchiveResult<bool> {
        let level = depth + 1;
        self.close(level)?;
        let Some(parent) = self.open.last_mut() else {
            return Err(ArchiveError::MissingRoot);
        };
        let (result, rx) = oneshot::channel();
        let path = parent.path.join(&name);
        parent.children.push(rx);
        let duplicate = parent.last_name.as_deref() == Some(name.as_str());
        parent.last_name = Some(name);

        if duplicate {
            // two raw names with the same lossy spelling
            let e = io::Error::new(io::ErrorKind::InvalidData, "duplicate entry name");
            self.fail(path, e, result)?;
            return Ok(false);
        }
        let meta = match meta {
            Ok(meta) => meta,
            Err(e) => {
                self.fail(path, e, result)?;
                return Ok(false);
            }
        };
        let mut info = EntryInfo::from_metadata(&meta);
        match info.kind {
            NodeKind::Dir => {
                self.open.push(Frame {
                    level,
                    path,
                    source: source.to_path_buf(),
                    info,
                    children: Vec::new(),
                    last_name: None,
                    error: listing_error,
                    result,
                });
                Ok(true)
            }
            kind => {
                if kind == NodeKind::Symlink {
                    match fs::read_link(source) {
                        Ok(target) => info.link_target = Some(target),
                        Err(e) => {
                            self.fail(path, e, result)?;
                            return Ok(false);
                        }
                    }
                }
                self.send(Job::File(FileJob {
                    path,
                    source: source.to_path_buf(),
                    info,
                    prior: None,
                    result,
                }))?;
                Ok(false)
            }
        }
    }

    /// Record that the directory just opened at `depth` could not be
    /// listed. Returns false if `source` is not that directory.
    fn listing_failed(&mut self, depth: usize, source: &Path, reason: String) -> bool {
        match self.open.last_mut() {
            Some(frame) if frame.level == depth + 1 && frame.source == source => {
                frame.error = Some(reason);
                true
            }
            _ => false,
        }
    }

    /// Take an error from walkdir. A directory that cannot be listed is
    /// archived empty with the error recorded on it. Anything else fails
    /// the entry.
    fn unreadable(
        &mut self,
        root_name: &str,
        err: walkdir::Error,
        filter: Option<&EntryFilter>,
    ) -> ArchiveResult<()> {
        let depth = err.depth();
        let Some(source) = err.path().map(Path::to_path_buf) else {
            // an entry of a listing that broke off midway; it has no name
            let path = self.open.last().map(|f| f.path.clone()).unwrap_or_default();
            let (result, _) = oneshot::channel();
            return self.fail(path, io::Error::from(err), result);
        };
        let reason = err
            .io_error()
            .map(|e| e.to_string())
            .unwrap_or_else(|| err.to_string());
        if self.listing_failed(depth, &source, reason.clone()) {
            return Ok(());
        }

        // walkdir gave no entry for it
        let name = match depth {
            0 => root_name.to_string(),
            _ => source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        match fs::symlink_metadata(&source) {
            Ok(meta) if meta.is_dir() => {
                if depth > 0 && filter.is_some_and(|f| !f(&source, &meta)) {
                    return Ok(());
                }
                self.entry(depth, name, &source, Ok(meta), Some(reason))?;
            }
            _ => {
                self.entry(depth, name, &source, Err(io::Error::from(err)), None)?;
            }
        }
        Ok(())
    }
}
