#![warn(missing_docs)]

//! Coffer archiving engine: snapshot ingestion with FastCDC chunking, BLAKE3
//! dedupe and incremental reuse of a parent snapshot
//!
//! Pipeline: walk (live + prior) → merge → file/dir workers → bounded saver → store
//! Finalize: snapshot record → flush → index

pub mod archiver;
pub mod chunker;
pub mod error;
pub mod job;
pub mod merge;
pub mod node;
pub mod path;
pub mod prior;
pub mod progress;
pub mod saver;
pub mod scan;
pub mod snapshot;
pub mod store_ext;
pub mod tree;
pub mod walk;
pub mod worker;

pub use archiver::{
    ArchiveConfig, Archiver, RunState, SnapshotOutcome, SnapshotRequest, SnapshotSummary,
};
pub use chunker::{Chunk, ChunkStream, Chunker, ChunkerConfig, FastCdcChunker};
pub use error::{ArchiveError, ArchiveResult};
pub use merge::{decide_reuse, DiffMerger, MergeStats, ReuseDecision};
pub use node::{EntryInfo, Node, NodeKind};
pub use prior::PriorTreeWalker;
pub use progress::{ErrorCallback, Progress, Stat};
pub use saver::{BlobSaver, SaverStats};
pub use scan::scan;
pub use snapshot::Snapshot;
pub use store_ext::StoreExt;
pub use tree::Tree;
pub use walk::{exclude_names, EntryFilter, FilesystemWalker};
