//! Shardsync CLI - shard replication through an object store.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shardsync::planner::{plan, write_plan_jsonl, HostRemap, PlanOptions, TaskPlan};
use shardsync::profile::Profile;
use shardsync::receiver::{default_subdir_router, run_recv, ReceiverOptions};
use shardsync::sender::{run_send, SenderOptions};
use shardsync::store::{SqliteTaskStore, StatusSummary, TaskStatus, TaskStore};
use shardsync::{offsetfs, DirBucket, ObjectStore, SyncError};

/// Shardsync - resumable shard replication through an object store
#[derive(Parser)]
#[command(name = "shardsync")]
#[command(version)]
#[command(about = "Replicate shard-structured datasets through an object store")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Diff two profiles and write the task plan as JSONL
    Plan {
        /// Profile of the transfer source
        #[arg(short, long, default_value = "profile.src.json")]
        src: PathBuf,

        /// Profile of the transfer destination
        #[arg(short, long, default_value = "profile.dst.json")]
        dst: PathBuf,

        /// Output file for the plan (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Drop tasks whose source is missing or on a network filesystem
        #[arg(long)]
        local_only: bool,

        /// Skip the sampled prefix verification
        #[arg(long)]
        skip_digest_check: bool,
    },

    /// Upload planned byte windows to the object store
    Send {
        /// Profile of the transfer source
        #[arg(short, long, default_value = "profile.src.json")]
        src: PathBuf,

        /// Profile of the transfer destination
        #[arg(short, long, default_value = "profile.dst.json")]
        dst: PathBuf,

        /// Path to the transfer configuration file
        #[arg(short, long, default_value = "shardsync.json")]
        config: PathBuf,

        /// Mount point for the offset-view filesystem
        #[arg(long, default_value = "/tmp/shardsync_offsetfs")]
        mountpoint: PathBuf,

        /// Concurrent uploads
        #[arg(long, default_value = "4")]
        concurrency: usize,

        /// Skip progress store operations
        #[arg(long)]
        skip_store: bool,
    },

    /// Download objects and reconcile them into place
    Recv {
        /// Profile of the transfer source
        #[arg(short, long, default_value = "profile.src.json")]
        src: PathBuf,

        /// Profile of the transfer destination
        #[arg(short, long, default_value = "profile.dst.json")]
        dst: PathBuf,

        /// Path to the transfer configuration file
        #[arg(short, long, default_value = "shardsync.json")]
        config: PathBuf,

        /// Cache directory downloads land in
        #[arg(short = 'C', long)]
        cache_dir: PathBuf,

        /// Destination root for routed placements (cache dir when omitted)
        #[arg(short = 'D', long)]
        dest_dir: Option<PathBuf>,

        /// Skip progress store operations
        #[arg(long)]
        skip_store: bool,
    },

    /// Mount an offset-view filesystem from a JSONL configuration
    Mount {
        /// Mount point (must exist)
        mountpoint: PathBuf,

        /// Path to the JSONL window configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Mount read-only
        #[arg(long)]
        read_only: bool,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Show transfer progress and statistics
    Status {
        /// Path to the transfer configuration file
        #[arg(short, long, default_value = "shardsync.json")]
        config: PathBuf,

        /// Skip progress store statistics
        #[arg(long)]
        skip_store: bool,
    },
}

/// Transfer configuration: where the bucket and the progress store live.
#[derive(Debug, Deserialize)]
struct TransferConfig {
    /// Directory bound as the object store (typically a mounted bucket).
    bucket_dir: PathBuf,

    /// Progress store database path.
    #[serde(default)]
    store_path: Option<PathBuf>,

    /// Host-path rewrite table applied before source access.
    #[serde(default)]
    remap: HostRemap,
}

impl TransferConfig {
    fn load(path: &Path) -> Result<Self, SyncError> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(Into::into)
    }

    fn open_store(&self, skip: bool) -> Result<Option<Arc<dyn TaskStore>>, SyncError> {
        if skip {
            return Ok(None);
        }
        let path = self
            .store_path
            .as_deref()
            .ok_or_else(|| SyncError::TaskStore("store_path not configured".into()))?;
        Ok(Some(Arc::new(SqliteTaskStore::open(path)?)))
    }
}

fn short_hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| {
            let h = h.to_string_lossy();
            h.split('.').next().unwrap_or(&h).to_string()
        })
        .unwrap_or_default()
}

fn load_plan(
    src: &Path,
    dst: &Path,
    remap: HostRemap,
    skip_digest_check: bool,
    local_only: bool,
) -> Result<TaskPlan, SyncError> {
    let src_profile = Profile::load(src)?;
    let dst_profile = Profile::load(dst)?;
    let opts = PlanOptions {
        skip_partial_digest_check: skip_digest_check,
        local_only,
        hostname: short_hostname(),
        remap,
    };
    let tasks = plan(&dst_profile, &src_profile, &opts)?;
    info!(count = tasks.len(), "Generated transfer tasks");
    Ok(tasks)
}

/// Resolves when an interrupt or termination signal arrives.
async fn shutdown_signal() {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
    let terminate = async {
        match terminate.as_mut() {
            Some(sig) => {
                sig.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        () = terminate => {}
    }
}

fn cancel_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown signal received, cancelling");
        signal_token.cancel();
    });
    token
}

fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    #[allow(clippy::cast_precision_loss)]
    let value = bytes as f64 / div as f64;
    format!("{value:.1} {}iB", ['K', 'M', 'G', 'T', 'P', 'E'][exp])
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), SyncError> {
    match cli.command {
        Commands::Plan {
            src,
            dst,
            output,
            local_only,
            skip_digest_check,
        } => {
            let tasks = load_plan(&src, &dst, HostRemap::default(), skip_digest_check, local_only)?;
            match output {
                Some(path) => write_plan_jsonl(&tasks, fs::File::create(path)?)?,
                None => write_plan_jsonl(&tasks, std::io::stdout().lock())?,
            }
            Ok(())
        }

        Commands::Send {
            src,
            dst,
            config,
            mountpoint,
            concurrency,
            skip_store,
        } => {
            let config = TransferConfig::load(&config)?;
            let tasks = load_plan(&src, &dst, config.remap.clone(), false, true)?;
            if tasks.is_empty() {
                info!("No tasks to execute");
                return Ok(());
            }
            let store = config.open_store(skip_store)?;
            let bucket: Arc<dyn ObjectStore> = Arc::new(DirBucket::create(&config.bucket_dir)?);
            let token = cancel_on_signal();
            let opts = SenderOptions {
                mountpoint,
                allow_other: false,
                concurrency,
            };
            run_send(&tasks, store.as_deref(), bucket, &opts, &token).await
        }

        Commands::Recv {
            src,
            dst,
            config,
            cache_dir,
            dest_dir,
            skip_store,
        } => {
            let config = TransferConfig::load(&config)?;
            // The receiver cannot reach source files; skip the prefix check.
            let tasks = load_plan(&src, &dst, config.remap.clone(), true, false)?;
            if tasks.is_empty() {
                info!("No tasks to execute");
                return Ok(());
            }
            let store = config.open_store(skip_store)?;
            let bucket: Arc<dyn ObjectStore> = Arc::new(DirBucket::create(&config.bucket_dir)?);
            let token = cancel_on_signal();
            let dest_root = dest_dir.unwrap_or_else(|| cache_dir.clone());
            let opts = ReceiverOptions::new(cache_dir, dest_root);
            let router = default_subdir_router();
            run_recv(&tasks, store, bucket, &router, &opts, &token).await
        }

        Commands::Mount {
            mountpoint,
            config,
            read_only,
            allow_other,
        } => {
            let windows = offsetfs::load_window_configs(&config)?;
            info!(entries = windows.len(), "Loaded window configuration");
            let unmount_point = mountpoint.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                warn!("Shutdown signal received, unmounting");
                offsetfs::lazy_unmount(&unmount_point);
            });
            tokio::task::spawn_blocking(move || {
                offsetfs::mount_blocking(windows, &mountpoint, read_only, allow_other)
            })
            .await
            .map_err(|e| SyncError::MountTask(e.to_string()))?
        }

        Commands::Status { config, skip_store } => {
            let config = TransferConfig::load(&config)?;
            let mut stats: BTreeMap<TaskStatus, StatusSummary> = BTreeMap::new();
            if let Some(store) = config.open_store(skip_store)? {
                stats = store.status_summary()?;
            }

            let bucket = DirBucket::create(&config.bucket_dir)?;
            let objects = bucket.list().await?;
            let in_bucket = StatusSummary {
                count: objects.len() as u64,
                size: objects.iter().map(|o| o.size).sum(),
            };
            stats.insert(TaskStatus::Uploaded, in_bucket);

            println!("{:<12} {:<8} {:<12}", "Status", "Count", "Total Size");
            println!("{:<12} {:<8} {:<12}", "------", "-----", "----------");
            for (status, summary) in &stats {
                println!(
                    "{:<12} {:<8} {:<12}",
                    status.to_string(),
                    summary.count,
                    format_size(summary.size)
                );
            }
            Ok(())
        }
    }
}
