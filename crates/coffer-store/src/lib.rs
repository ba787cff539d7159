#![warn(missing_docs)]

//! Coffer content store: BLAKE3-addressed blobs, trees, snapshots and index
//!
//! Blobs (file chunks and serialized trees) are keyed by the BLAKE3 digest of
//! their bytes, so identical content is stored at most once. Snapshot records
//! and index files are stored unpacked, one object per file.

pub mod blob;
pub mod error;
pub mod id;
pub mod index;
pub mod local;
pub mod memory;
pub mod store;

pub use blob::{BlobKind, UnpackedKind};
pub use error::{StoreError, StoreResult};
pub use id::ContentId;
pub use index::{Index, IndexEntry};
pub use local::{LocalStore, LocalStoreConfig};
pub use memory::{MemoryStore, StoreStats};
pub use store::ContentStore;
