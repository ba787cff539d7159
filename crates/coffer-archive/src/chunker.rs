//! Content-defined chunking (FastCDC) of file streams

use std::io::{self, Read};

use bytes::Bytes;
use coffer_store::ContentId;
use fastcdc::v2020::StreamCDC;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{ArchiveError, ArchiveResult};

/// A content-defined chunk of one file, alive only while the file is ingested.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Chunk content
    pub data: Bytes,
    /// BLAKE3 hash of the content
    pub id: ContentId,
    /// Length in bytes
    pub length: u64,
}

impl Chunk {
    /// Hash `data` into a chunk.
    pub fn new(data: Bytes) -> Self {
        Self {
            id: ContentId::hash(&data),
            length: data.len() as u64,
            data,
        }
    }
}

/// FastCDC parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Minimum chunk size in bytes
    pub min_size: usize,
    /// Average (target) chunk size in bytes
    pub avg_size: usize,
    /// Maximum chunk size in bytes
    pub max_size: usize,
    /// Chunks read ahead of the consumer
    pub read_ahead: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: 32 * 1024,
            avg_size: 64 * 1024,
            max_size: 512 * 1024,
            read_ahead: 4,
        }
    }
}

impl ChunkerConfig {
    /// Check the sizes against the ranges FastCDC accepts.
    pub fn validate(&self) -> ArchiveResult<()> {
        let in_range = |name: &str, value: usize, lo: usize, hi: usize| {
            if value < lo || value > hi {
                Err(ArchiveError::InvalidConfig(format!(
                    "chunker {name} {value} outside {lo}..={hi}"
                )))
            } else {
                Ok(())
            }
        };
        in_range("min_size", self.min_size, 64, 1_048_576)?;
        in_range("avg_size", self.avg_size, 256, 4_194_304)?;
        in_range("max_size", self.max_size, 1024, 16_777_216)?;
        if self.min_size > self.avg_size || self.avg_size > self.max_size {
            return Err(ArchiveError::InvalidConfig(
                "chunker sizes must satisfy min_size <= avg_size <= max_size".into(),
            ));
        }
        if self.read_ahead == 0 {
            return Err(ArchiveError::InvalidConfig("chunker read_ahead must be > 0".into()));
        }
        Ok(())
    }
}

/// Ordered, finite, non-restartable sequence of chunks of one file.
pub struct ChunkStream {
    rx: mpsc::Receiver<io::Result<Chunk>>,
}

impl ChunkStream {
    /// Wrap the receiving end of a chunk producer.
    pub fn new(rx: mpsc::Receiver<io::Result<Chunk>>) -> Self {
        Self { rx }
    }

    /// Next chunk, `None` once the file is exhausted.
    pub async fn next(&mut self) -> Option<io::Result<Chunk>> {
        self.rx.recv().await
    }
}

/// Splits a byte stream into chunks with stable boundaries.
pub trait Chunker: Send + Sync {
    /// Start chunking `reader`. Must be called from within a tokio runtime.
    fn chunk(&self, reader: Box<dyn Read + Send>) -> ChunkStream;
}

/// FastCDC (2020) chunker reading on the blocking pool.
#[derive(Debug, Clone, Default)]
pub struct FastCdcChunker {
    config: ChunkerConfig,
}

impl FastCdcChunker {
    /// Create a chunker with custom configuration
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Chunker parameters
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }
}

impl Chunker for FastCdcChunker {
    fn chunk(&self, reader: Box<dyn Read + Send>) -> ChunkStream {
        let (tx, rx) = mpsc::channel(self.config.read_ahead.max(1));
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let chunks = StreamCDC::new(
                reader,
                config.min_size as u32,
                config.avg_size as u32,
                config.max_size as u32,
            );
            for item in chunks {
                let item = match item {
                    Ok(data) => Ok(Chunk::new(Bytes::from(data.data))),
                    Err(fastcdc::v2020::Error::IoError(e)) => Err(e),
                    Err(other) => Err(io::Error::other(format!("{other:?}"))),
                };
                let failed = item.is_err();
                // receiver gone: the file was abandoned
                if tx.blocking_send(item).is_err() || failed {
                    break;
                }
            }
        });
        ChunkStream::new(rx)
    }
}
