//! Command-line parsing and the commands themselves.

use crate::config::{CofferConfig, LogFormat};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coffer_archive::{
    exclude_names, scan, Archiver, NodeKind, PriorTreeWalker, Progress, SnapshotOutcome,
    SnapshotRequest, StoreExt,
};
use coffer_store::{ContentId, ContentStore, LocalStore, MemoryStore, UnpackedKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exit status of a backup that saved a snapshot but skipped some entries.
pub const EXIT_ENTRY_ERRORS: u8 = 3;
/// Exit status of an interrupted backup.
pub const EXIT_CANCELLED: u8 = 130;

/// Command line.
#[derive(Parser)]
#[command(name = "coffer")]
#[command(about = "Content-addressed snapshot archiver", long_about = None)]
pub struct Cli {
    /// Repository directory
    #[arg(short, long, env = "COFFER_REPOSITORY")]
    pub repo: Option<PathBuf>,

    /// Configuration file (.toml or .json)
    #[arg(short, long, env = "COFFER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Command to run
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Snapshot PATHS into the repository
    Backup {
        /// Parent snapshot (ID or unique prefix); defaults to the latest
        /// snapshot of the same paths
        #[arg(long, conflicts_with_all = ["no_parent", "dry_run"])]
        parent: Option<String>,
        /// Read every file instead of reusing a previous snapshot
        #[arg(long)]
        no_parent: bool,
        /// File name to skip, repeatable
        #[arg(short, long)]
        exclude: Vec<String>,
        /// Archive into memory without writing to the repository
        #[arg(long)]
        dry_run: bool,
        /// Print progress every second
        #[arg(long)]
        progress: bool,
        /// Files and directories to archive
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Count files, directories and bytes below PATHS
    Scan {
        /// Files and directories to count
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// List snapshots, oldest first
    Snapshots,
    /// List every entry of a snapshot
    Ls {
        /// Snapshot ID or unique prefix
        snapshot: String,
    },
}

impl Cli {
    /// Load the configuration file and apply command-line overrides.
    ///
    /// Also returns the configuration path if one was given but does not
    /// exist, so the caller can warn once logging is up.
    pub fn load_config(&self) -> Result<(CofferConfig, Option<PathBuf>)> {
        let (mut config, missing) = match &self.config {
            Some(path) if path.exists() => {
                let config = CofferConfig::from_file(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                (config, None)
            }
            Some(path) => (CofferConfig::default(), Some(path.clone())),
            None => (CofferConfig::default(), None),
        };
        if let Some(repo) = &self.repo {
            config.repository = repo.clone();
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Command::Backup { exclude, .. } = &self.command {
            config.archive.exclude.extend(exclude.iter().cloned());
        }
        Ok((config, missing))
    }

    /// Run the command; returns the process exit status.
    pub async fn run(self, config: CofferConfig) -> Result<u8> {
        match &self.command {
            Command::Backup {
                parent,
                no_parent,
                dry_run,
                progress,
                paths,
                ..
            } => {
                let parent = if *no_parent {
                    ParentChoice::None
                } else if let Some(prefix) = parent {
                    ParentChoice::Given(prefix.clone())
                } else {
                    ParentChoice::Latest
                };
                self.backup(&config, parent, *dry_run, *progress, paths).await
            }
            Command::Scan { paths } => self.scan(&config, paths).await,
            Command::Snapshots => self.snapshots(&config).await,
            Command::Ls { snapshot } => self.ls(&config, snapshot).await,
        }
    }

    async fn backup(
        &self,
        config: &CofferConfig,
        parent: ParentChoice,
        dry_run: bool,
        show_progress: bool,
        paths: &[PathBuf],
    ) -> Result<u8> {
        let store: Arc<dyn ContentStore> = if dry_run {
            info!("dry run, archiving into memory");
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(open_store(config, true).await?)
        };
        let archiver = Archiver::new(store.clone(), config.archive.clone())?;

        let parent = match parent {
            ParentChoice::None => None,
            ParentChoice::Given(prefix) => Some(resolve_snapshot(store.as_ref(), &prefix).await?),
            ParentChoice::Latest => archiver.find_parent(paths).await?.and_then(|s| s.id),
        };
        if let Some(id) = &parent {
            info!(parent = %id.short(), "using parent snapshot");
        }

        let stop = archiver.stop_token();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping backup");
                stop.cancel();
            }
        });

        let progress = Arc::new(Progress::new());
        let ticker = show_progress.then(|| {
            spawn_progress(
                progress.clone(),
                paths.to_vec(),
                config.archive.exclude.clone(),
            )
        });

        let request = SnapshotRequest::new(paths.to_vec())
            .parent(parent)
            .progress(progress);
        let outcome = archiver.snapshot(request).await;
        interrupt.abort();
        if let Some(ticker) = ticker {
            ticker.abort();
        }

        match outcome? {
            SnapshotOutcome::Cancelled => {
                eprintln!("Backup cancelled, no snapshot saved");
                Ok(EXIT_CANCELLED)
            }
            SnapshotOutcome::Completed(summary) => {
                let suffix = if dry_run { " (dry run)" } else { "" };
                println!("Snapshot {} saved{}", summary.id, suffix);
                println!(
                    "Files: {}  Dirs: {}  Size: {}",
                    summary.stats.files,
                    summary.stats.dirs,
                    format_bytes(summary.stats.bytes)
                );
                println!(
                    "Reused files: {}  Chunks written: {}  Deduplicated: {}",
                    summary.reused_files, summary.saver.written, summary.saver.deduplicated
                );
                if summary.stats.errors > 0 {
                    eprintln!("{} entries could not be archived", summary.stats.errors);
                    return Ok(EXIT_ENTRY_ERRORS);
                }
                Ok(0)
            }
        }
    }

    async fn scan(&self, config: &CofferConfig, paths: &[PathBuf]) -> Result<u8> {
        let filter = exclude_names(&config.archive.exclude);
        let paths = paths.to_vec();
        let stat = tokio::task::spawn_blocking(move || scan(&paths, filter.as_ref())).await?;

        println!("Files: {}", stat.files);
        println!("Dirs: {}", stat.dirs);
        println!("Size: {}", format_bytes(stat.bytes));
        println!("Errors: {}", stat.errors);

        Ok(0)
    }

    async fn snapshots(&self, config: &CofferConfig) -> Result<u8> {
        let store = open_store(config, false).await?;
        let snapshots = store.list_snapshots().await?;

        println!("{:<10} {:<20} {:<16} {}", "ID", "TIME", "HOST", "PATHS");
        println!("{}", "-".repeat(70));

        for snapshot in snapshots {
            println!(
                "{:<10} {:<20} {:<16} {}",
                snapshot.id.map(|id| id.short()).unwrap_or_default(),
                snapshot.time.format("%Y-%m-%d %H:%M:%S").to_string(),
                snapshot.hostname.as_deref().unwrap_or("-"),
                snapshot.paths.join(", ")
            );
        }

        Ok(0)
    }

    async fn ls(&self, config: &CofferConfig, snapshot: &str) -> Result<u8> {
        let store: Arc<dyn ContentStore> = Arc::new(open_store(config, false).await?);
        let id = resolve_snapshot(store.as_ref(), snapshot).await?;
        let snapshot = store.load_snapshot(&id).await?;

        let (tx, mut rx) = mpsc::channel(64);
        let walker = PriorTreeWalker::new(store.clone(), snapshot.tree);
        let walk = tokio::spawn(walker.walk(tx, CancellationToken::new()));

        let mut entries = 0u64;
        while let Some(node) = rx.recv().await {
            // the unnamed top-level directory
            if node.path.as_os_str().is_empty() {
                continue;
            }
            let kind = match node.kind {
                NodeKind::File => "file",
                NodeKind::Dir => "dir",
                NodeKind::Symlink => "symlink",
                NodeKind::Other => "other",
            };
            match &node.link_target {
                Some(target) => println!(
                    "{:<8} {:>12} {} -> {}",
                    kind,
                    node.size,
                    node.path.display(),
                    target
                ),
                None => println!("{:<8} {:>12} {}", kind, node.size, node.path.display()),
            }
            if let Some(error) = &node.error {
                println!("{:<8} {:>12}   error: {}", "", "", error);
            }
            entries += 1;
        }
        walk.await??;
        info!(snapshot = %id.short(), entries, "listed snapshot");

        Ok(0)
    }
}

enum ParentChoice {
    None,
    Given(String),
    Latest,
}

async fn open_store(config: &CofferConfig, create: bool) -> Result<LocalStore> {
    if !create && !config.repository.is_dir() {
        anyhow::bail!("No repository at {}", config.repository.display());
    }
    LocalStore::open(&config.repository, config.store.clone())
        .await
        .with_context(|| format!("opening repository {}", config.repository.display()))
}

fn spawn_progress(progress: Arc<Progress>, paths: Vec<PathBuf>, exclude: Vec<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let filter = exclude_names(&exclude);
        let total = tokio::task::spawn_blocking(move || scan(&paths, filter.as_ref()))
            .await
            .unwrap_or_default();
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let done = progress.stat();
            eprintln!(
                "[{}/{} files] {} / {}, {} errors",
                done.files,
                total.files,
                format_bytes(done.bytes),
                format_bytes(total.bytes),
                done.errors
            );
        }
    })
}

/// Resolve a full snapshot ID or a unique hex prefix of one.
pub async fn resolve_snapshot(store: &dyn ContentStore, prefix: &str) -> Result<ContentId> {
    let prefix = prefix.trim().to_ascii_lowercase();
    if prefix.is_empty() {
        anyhow::bail!("Empty snapshot ID");
    }
    let matches: Vec<ContentId> = store
        .list_unpacked(UnpackedKind::Snapshot)
        .await?
        .into_iter()
        .filter(|id| id.to_hex().starts_with(&prefix))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => anyhow::bail!("No snapshot matches {}", prefix),
        _ => anyhow::bail!("Snapshot prefix {} is ambiguous ({} matches)", prefix, matches.len()),
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
