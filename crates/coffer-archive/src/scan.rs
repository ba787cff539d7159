//! Pre-pass counting what a snapshot will cover.

use std::path::PathBuf;

use tracing::debug;
use walkdir::WalkDir;

use crate::progress::Stat;
use crate::walk::{admits, EntryFilter};

/// Count regular files, directories and bytes below `paths`, honouring
/// `filter`. Symlinks and special files are not counted. Entries that
/// cannot be read are counted as errors. Blocking.
pub fn scan(paths: &[PathBuf], filter: Option<&EntryFilter>) -> Stat {
    let mut stat = Stat::default();
    for root in paths {
        let entries = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| admits(filter, entry));
        for entry in entries {
            match entry {
                Ok(entry) if entry.file_type().is_dir() => stat.dirs += 1,
                Ok(entry) if entry.file_type().is_file() => {
                    stat.files += 1;
                    stat.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "scan error");
                    stat.errors += 1;
                }
            }
        }
    }
    stat
}
