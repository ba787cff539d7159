//! Error types for the archiving pipeline.

use std::path::PathBuf;

use coffer_store::StoreError;

/// Result type alias for archiver operations.
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// All errors that can occur while taking a snapshot.
///
/// Entry errors ([`ArchiveError::is_fatal`] returns false) affect a single
/// file or directory: they are reported through the error callback and the
/// entry is skipped, unless the callback escalates them to
/// [`ArchiveError::Aborted`]. Everything else aborts the run.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Nothing to archive
    #[error("No paths to archive")]
    NoPaths,
    /// Rejected configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// A root path cannot be archived
    #[error("Invalid root path {path:?}: {reason}")]
    InvalidRoot {
        /// The rejected path
        path: PathBuf,
        /// Why it was rejected
        reason: String,
    },
    /// Stat, open or read failed for one entry
    #[error("I/O error for {path:?}: {source}")]
    Io {
        /// Archive path of the entry
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// A directory listing failed; the directory is archived empty
    #[error("Cannot read directory {path:?}: {reason}")]
    ReadDir {
        /// Archive path of the directory
        path: PathBuf,
        /// Error message recorded on the directory node
        reason: String,
    },
    /// The file was modified between the walk and the read (warning)
    #[error("File {path:?} has changed since it was scanned")]
    FileChanged {
        /// Archive path of the file
        path: PathBuf,
    },
    /// Saved bytes do not add up to the file size
    #[error("Error saving {path:?}: saved {saved} bytes, wanted {expected} bytes")]
    SizeMismatch {
        /// Archive path of the file
        path: PathBuf,
        /// Bytes covered by the saved chunks
        saved: u64,
        /// File size at read time
        expected: u64,
    },
    /// A walker emitted paths out of walk order
    #[error("{side} stream out of order: {current:?} after {previous:?}")]
    OutOfOrder {
        /// Which stream ("prior" or "live")
        side: &'static str,
        /// Last accepted path
        previous: PathBuf,
        /// Offending path
        current: PathBuf,
    },
    /// The content store failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    /// Tree or snapshot encoding failed
    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    /// A pipeline task panicked or vanished
    #[error("Pipeline task failed: {0}")]
    Task(String),
    /// The pipeline finished without producing the root tree
    #[error("Root tree was not produced")]
    MissingRoot,
    /// The error callback turned an entry error into an abort
    #[error("Aborted at {path:?}: {source}")]
    Aborted {
        /// Archive path of the entry
        path: PathBuf,
        /// The entry error that was escalated
        #[source]
        source: Box<ArchiveError>,
    },
    /// The run was stopped
    #[error("Archiving cancelled")]
    Cancelled,
}

impl ArchiveError {
    /// Whether this error aborts the whole run.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ArchiveError::Io { .. }
                | ArchiveError::ReadDir { .. }
                | ArchiveError::FileChanged { .. }
                | ArchiveError::SizeMismatch { .. }
        )
    }

    /// Warnings are reported but neither skip the entry nor count as errors.
    pub fn is_warning(&self) -> bool {
        matches!(self, ArchiveError::FileChanged { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ArchiveError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<tokio::task::JoinError> for ArchiveError {
    fn from(err: tokio::task::JoinError) -> Self {
        ArchiveError::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let entry = ArchiveError::io("a", std::io::Error::other("boom"));
        assert!(!entry.is_fatal());
        assert!(!ArchiveError::SizeMismatch {
            path: "a".into(),
            saved: 1,
            expected: 2
        }
        .is_fatal());
        assert!(ArchiveError::FileChanged { path: "a".into() }.is_warning());
        assert!(ArchiveError::Store(StoreError::Backend("down".into())).is_fatal());
        assert!(ArchiveError::OutOfOrder {
            side: "live",
            previous: "b".into(),
            current: "a".into()
        }
        .is_fatal());
        let escalated = ArchiveError::Aborted {
            path: "a".into(),
            source: Box::new(entry),
        };
        assert!(escalated.is_fatal());
    }

    #[test]
    fn messages_name_the_path() {
        let err = ArchiveError::SizeMismatch {
            path: "dir/file".into(),
            saved: 3,
            expected: 5,
        };
        assert_eq!(
            err.to_string(),
            "Error saving \"dir/file\": saved 3 bytes, wanted 5 bytes"
        );
    }
}
