//! End-to-end snapshot runs against the in-memory and local stores.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use coffer_archive::{
    ArchiveConfig, ArchiveError, Archiver, Chunk, ChunkStream, Chunker, ErrorCallback,
    FastCdcChunker, NodeKind, RunState, SnapshotOutcome, SnapshotRequest, SnapshotSummary,
    StoreExt, Tree,
};
use coffer_store::{
    BlobKind, ContentId, ContentStore, LocalStore, LocalStoreConfig, MemoryStore, UnpackedKind,
};
use tempfile::TempDir;

fn source(files: &[(&str, &str)]) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("data");
    fs::create_dir_all(&root).unwrap();
    for (name, content) in files {
        let path = root.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
    (dir, root)
}

fn archiver(store: Arc<dyn ContentStore>) -> Archiver {
    Archiver::new(store, ArchiveConfig::default()).unwrap()
}

async fn run(archiver: &Archiver, root: &Path, parent: Option<ContentId>) -> SnapshotSummary {
    archiver
        .create_snapshot(vec![root.to_path_buf()], parent, None)
        .await
        .unwrap()
        .completed()
        .unwrap()
}

/// Tree of the single root directory of a snapshot.
async fn root_dir(store: &dyn ContentStore, summary: &SnapshotSummary) -> Tree {
    let top = store.load_tree(&summary.snapshot.tree).await.unwrap();
    assert_eq!(top.len(), 1);
    let dir = &top.nodes[0];
    assert_eq!(dir.kind, NodeKind::Dir);
    store.load_tree(&dir.subtree.unwrap()).await.unwrap()
}

fn collecting_callback() -> (ErrorCallback, Arc<Mutex<Vec<(PathBuf, String)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: ErrorCallback = Arc::new(move |path: &Path, err: &ArchiveError| {
        sink.lock().unwrap().push((path.to_path_buf(), err.to_string()));
        Ok(())
    });
    (callback, seen)
}

#[tokio::test]
async fn hello_then_incremental_world() {
    let (_dir, root) = source(&[("a.txt", "hello")]);
    let store = Arc::new(MemoryStore::new());
    let archiver = archiver(store.clone());

    let first = run(&archiver, &root, None).await;
    let hello = ContentId::hash(b"hello");
    assert_eq!(store.blob_count(BlobKind::Data), 1);
    assert!(store.contains(&hello));
    let tree = root_dir(store.as_ref(), &first).await;
    assert_eq!(tree.len(), 1);
    let a = tree.find("a.txt").unwrap();
    assert_eq!(a.content, vec![hello]);
    assert_eq!(a.size, 5);
    // the root directory's tree plus the top-level tree
    assert_eq!(store.blob_count(BlobKind::Tree), 2);
    let stored = store.load_snapshot(&first.id).await.unwrap();
    assert_eq!(stored.tree, first.snapshot.tree);
    assert_eq!(first.stats.files, 1);
    assert_eq!(first.stats.bytes, 5);
    assert_eq!(first.stats.errors, 0);
    assert_eq!(archiver.state(), RunState::Done);
    assert_eq!(store.stats().flushes, 1);
    assert_eq!(store.stats().index_writes, 1);

    fs::write(root.join("b.txt"), b"world").unwrap();
    let writes_before = store.stats().data_writes;
    let second = run(&archiver, &root, Some(first.id)).await;
    assert_eq!(store.stats().data_writes - writes_before, 1);
    assert_eq!(second.saver.written, 1);
    assert_eq!(second.reused_files, 1);
    assert_eq!(second.snapshot.parent, Some(first.id));
    let tree = root_dir(store.as_ref(), &second).await;
    assert_eq!(tree.find("a.txt").unwrap().content, vec![hello]);
    assert_eq!(tree.find("b.txt").unwrap().content, vec![ContentId::hash(b"world")]);
}

#[tokio::test]
async fn unchanged_tree_is_deterministic_and_deduplicated() {
    let (_dir, root) = source(&[("a.txt", "alpha"), ("sub/b.txt", "beta"), ("sub/c", "")]);
    let store = Arc::new(MemoryStore::new());
    let archiver = archiver(store.clone());

    let first = run(&archiver, &root, None).await;
    let writes = store.stats().data_writes;
    let second = run(&archiver, &root, None).await;
    assert_eq!(first.snapshot.tree, second.snapshot.tree);
    assert_ne!(first.id, second.id);
    assert_eq!(store.stats().data_writes, writes);
    assert_eq!(second.saver.written, 0);
    assert_eq!(second.saver.deduplicated, 2);

    let third = run(&archiver, &root, Some(second.id)).await;
    assert_eq!(third.snapshot.tree, first.snapshot.tree);
    // the empty file has no chunks and is reused as well
    assert_eq!(third.reused_files, 3);
    assert_eq!(store.unpacked_count(UnpackedKind::Snapshot), 3);
}

#[tokio::test]
async fn identical_content_is_stored_once_across_paths() {
    let (_dir, root) = source(&[
        ("x/one.txt", "same bytes"),
        ("y/two.txt", "same bytes"),
        ("y/three.txt", "other bytes"),
    ]);
    let store = Arc::new(MemoryStore::new());
    let summary = run(&archiver(store.clone()), &root, None).await;
    assert_eq!(store.blob_count(BlobKind::Data), 2);
    assert_eq!(summary.saver.written, 2);

    let tree = root_dir(store.as_ref(), &summary).await;
    let x = store.load_tree(&tree.find("x").unwrap().subtree.unwrap()).await.unwrap();
    let y = store.load_tree(&tree.find("y").unwrap().subtree.unwrap()).await.unwrap();
    assert_eq!(
        x.find("one.txt").unwrap().content,
        y.find("two.txt").unwrap().content
    );
}

struct Truncating(FastCdcChunker);

impl Chunker for Truncating {
    fn chunk(&self, reader: Box<dyn Read + Send>) -> ChunkStream {
        self.0.chunk(Box::new(reader.take(3)))
    }
}

#[tokio::test]
async fn truncated_reads_skip_the_file() {
    let (_dir, root) = source(&[("long.txt", "hello"), ("ok.txt", "ab")]);
    let store = Arc::new(MemoryStore::new());
    let archiver =
        archiver(store.clone()).with_chunker(Arc::new(Truncating(FastCdcChunker::default())));
    let (callback, seen) = collecting_callback();
    let summary = archiver
        .create_snapshot(vec![root.clone()], None, Some(callback))
        .await
        .unwrap()
        .completed()
        .unwrap();

    assert_eq!(summary.stats.errors, 1);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, PathBuf::from("data/long.txt"));
    let tree = root_dir(store.as_ref(), &summary).await;
    assert!(tree.find("long.txt").is_none());
    assert_eq!(tree.find("ok.txt").unwrap().size, 2);
}

#[tokio::test]
async fn escalated_size_mismatch_aborts_without_a_snapshot() {
    let (_dir, root) = source(&[("long.txt", "hello"), ("ok.txt", "ab")]);
    let store = Arc::new(MemoryStore::new());
    let archiver =
        archiver(store.clone()).with_chunker(Arc::new(Truncating(FastCdcChunker::default())));
    let strict: ErrorCallback = Arc::new(|_: &Path, err: &ArchiveError| match err {
        ArchiveError::SizeMismatch { .. } => Err(ArchiveError::InvalidConfig("strict".into())),
        _ => Ok(()),
    });
    let err = archiver
        .create_snapshot(vec![root], None, Some(strict))
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        ArchiveError::Aborted { path, source }
            if path == Path::new("data/long.txt")
                && matches!(**source, ArchiveError::InvalidConfig(_))
    ));
    assert_eq!(archiver.state(), RunState::Aborted);
    assert_eq!(store.unpacked_count(UnpackedKind::Snapshot), 0);
}

/// Gives every file the same chunk. A file containing `shared` gets it after
/// a short pause; any other file gets it first and then a read error.
struct SharedChunk;

impl Chunker for SharedChunk {
    fn chunk(&self, mut reader: Box<dyn Read + Send>) -> ChunkStream {
        let mut content = String::new();
        let _ = reader.read_to_string(&mut content);
        let (tx, rx) = tokio::sync::mpsc::channel(2);
        tokio::spawn(async move {
            let shared = Chunk::new(Bytes::from_static(b"shared"));
            if content == "shared" {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = tx.send(Ok(shared)).await;
            } else {
                let _ = tx.send(Ok(shared)).await;
                let _ = tx.send(Err(std::io::Error::other("device went away"))).await;
            }
        });
        ChunkStream::new(rx)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chunks_shared_with_a_failed_file_are_stored_before_finalizing() {
    let (_dir, root) = source(&[("a.txt", "broken"), ("b.txt", "shared")]);
    let store = Arc::new(MemoryStore::new().with_write_delay(Duration::from_millis(500)));
    let archiver = archiver(store.clone()).with_chunker(Arc::new(SharedChunk));
    let (callback, seen) = collecting_callback();
    let summary = archiver
        .create_snapshot(vec![root], None, Some(callback))
        .await
        .unwrap()
        .completed()
        .unwrap();

    let shared = ContentId::hash(b"shared");
    assert!(store.contains(&shared));
    assert_eq!(summary.stats.errors, 1);
    assert_eq!(seen.lock().unwrap()[0].0, PathBuf::from("data/a.txt"));
    let tree = root_dir(store.as_ref(), &summary).await;
    assert!(tree.find("a.txt").is_none());
    assert_eq!(tree.find("b.txt").unwrap().content, vec![shared]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chunk_saves_stay_within_the_permit_pool() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("many");
    for d in 0..12 {
        let sub = root.join(format!("d{d:02}"));
        fs::create_dir_all(&sub).unwrap();
        for f in 0..100 {
            fs::write(sub.join(format!("f{f:03}")), format!("file {d}/{f}")).unwrap();
        }
    }
    let store = Arc::new(MemoryStore::new().with_write_delay(Duration::from_millis(1)));
    let config = ArchiveConfig {
        file_workers: 16,
        max_concurrent_saves: 8,
        ..ArchiveConfig::default()
    };
    let archiver = Archiver::new(store.clone(), config).unwrap();
    let summary = run(&archiver, &root, None).await;

    assert_eq!(summary.stats.files, 1200);
    assert_eq!(summary.stats.dirs, 14);
    assert_eq!(store.blob_count(BlobKind::Data), 1200);
    assert!(summary.saver.peak_in_flight <= 8);
    assert!(store.stats().peak_data_in_flight <= 8);
}

#[tokio::test]
async fn stopped_archiver_stores_no_snapshot() {
    let (_dir, root) = source(&[("a.txt", "hello")]);
    let store = Arc::new(MemoryStore::new());
    let archiver = archiver(store.clone());
    archiver.stop();
    let outcome = archiver
        .create_snapshot(vec![root], None, None)
        .await
        .unwrap();
    assert!(matches!(outcome, SnapshotOutcome::Cancelled));
    assert_eq!(archiver.state(), RunState::Aborted);
    assert_eq!(store.unpacked_count(UnpackedKind::Snapshot), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_mid_run_stops_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("slow");
    fs::create_dir_all(&root).unwrap();
    for f in 0..200 {
        fs::write(root.join(format!("f{f:03}")), format!("content {f}")).unwrap();
    }
    let store = Arc::new(MemoryStore::new().with_write_delay(Duration::from_millis(20)));
    let config = ArchiveConfig {
        max_concurrent_saves: 2,
        ..ArchiveConfig::default()
    };
    let archiver = Archiver::new(store.clone(), config).unwrap();
    let stop = archiver.stop_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();
    });
    let started = std::time::Instant::now();
    let outcome = archiver
        .create_snapshot(vec![root], None, None)
        .await
        .unwrap();
    assert!(matches!(outcome, SnapshotOutcome::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(store.unpacked_count(UnpackedKind::Snapshot), 0);
    assert!(store.blob_count(BlobKind::Data) < 200);
}

#[tokio::test]
async fn store_failures_abort_the_run() {
    let (_dir, root) = source(&[("a.txt", "hello")]);
    let store = Arc::new(MemoryStore::new());
    store.set_fail_writes(true);
    let archiver = archiver(store.clone());
    let err = archiver
        .create_snapshot(vec![root], None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ArchiveError::Store(_)));
    assert!(err.is_fatal());
    assert_eq!(archiver.state(), RunState::Aborted);
    assert_eq!(store.unpacked_count(UnpackedKind::Snapshot), 0);
}

#[tokio::test]
async fn modified_and_removed_files() {
    let (_dir, root) = source(&[("a.txt", "hello"), ("b.txt", "bye"), ("c.txt", "keep")]);
    let store = Arc::new(MemoryStore::new());
    let archiver = archiver(store.clone());
    let first = run(&archiver, &root, None).await;

    fs::write(root.join("a.txt"), b"hello world").unwrap();
    fs::remove_file(root.join("b.txt")).unwrap();
    let second = run(&archiver, &root, Some(first.id)).await;

    assert_eq!(second.reused_files, 1);
    assert_eq!(second.saver.written, 1);
    let tree = root_dir(store.as_ref(), &second).await;
    let names: Vec<_> = tree.nodes.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "c.txt"]);
    assert_eq!(
        tree.find("a.txt").unwrap().content,
        vec![ContentId::hash(b"hello world")]
    );
}

#[tokio::test]
async fn lost_chunks_are_rewritten_instead_of_reused() {
    let (_dir, root) = source(&[("a.txt", "hello")]);
    let store = Arc::new(MemoryStore::new());
    let archiver = archiver(store.clone());
    let first = run(&archiver, &root, None).await;

    assert!(store.remove(&ContentId::hash(b"hello")));
    let second = run(&archiver, &root, Some(first.id)).await;
    assert_eq!(second.reused_files, 0);
    assert_eq!(second.saver.written, 1);
    assert!(store.contains(&ContentId::hash(b"hello")));
    assert_eq!(second.snapshot.tree, first.snapshot.tree);
}

#[tokio::test]
async fn excludes_multiple_roots_and_parent_lookup() {
    let (dir, root) = source(&[("a.txt", "a"), (".cache/blob", "junk")]);
    let other = dir.path().join("other");
    fs::create_dir_all(&other).unwrap();
    fs::write(other.join("o.txt"), b"o").unwrap();

    let store = Arc::new(MemoryStore::new());
    let config = ArchiveConfig {
        exclude: vec![".cache".into()],
        ..ArchiveConfig::default()
    };
    let archiver = Archiver::new(store.clone(), config).unwrap();
    let paths = vec![other.clone(), root.clone()];
    let summary = archiver
        .snapshot(SnapshotRequest::new(paths.clone()))
        .await
        .unwrap()
        .completed()
        .unwrap();

    let top = store.load_tree(&summary.snapshot.tree).await.unwrap();
    let names: Vec<_> = top.nodes.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["data", "other"]);
    let data = store.load_tree(&top.nodes[0].subtree.unwrap()).await.unwrap();
    assert!(data.find(".cache").is_none());
    assert!(!store.contains(&ContentId::hash(b"junk")));
    assert_eq!(summary.snapshot.paths.len(), 2);

    let parent = archiver.find_parent(&paths).await.unwrap().unwrap();
    assert_eq!(parent.id, Some(summary.id));
    assert!(archiver.find_parent(&[root]).await.unwrap().is_none());
}

#[tokio::test]
async fn local_store_round_trip_across_reopen() {
    let repo = tempfile::tempdir().unwrap();
    let (_dir, root) = source(&[("a.txt", "hello"), ("sub/b.txt", "world")]);

    let first = {
        let store = Arc::new(
            LocalStore::open(repo.path(), LocalStoreConfig::default())
                .await
                .unwrap(),
        );
        run(&archiver(store), &root, None).await
    };

    let store = Arc::new(
        LocalStore::open(repo.path(), LocalStoreConfig::default())
            .await
            .unwrap(),
    );
    assert_eq!(store.list_snapshots().await.unwrap().len(), 1);
    let tree = root_dir(store.as_ref(), &first).await;
    let a = tree.find("a.txt").unwrap();
    let data = store.load(BlobKind::Data, &a.content[0]).await.unwrap();
    assert_eq!(&data[..], b"hello");

    let second = run(&archiver(store.clone()), &root, Some(first.id)).await;
    assert_eq!(second.reused_files, 2);
    assert_eq!(second.saver.written, 0);
    assert_eq!(second.snapshot.tree, first.snapshot.tree);
    assert_eq!(store.list_snapshots().await.unwrap().len(), 2);
}
