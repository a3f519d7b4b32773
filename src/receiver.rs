//! Receiver pipeline.
//!
//! Lists the bucket, downloads outstanding objects into a cache directory,
//! and concurrently reconciles completed downloads into their final
//! locations. A reconcile pass walks the cache, verifies sizes, places each
//! eligible file through the move/append reconciler on a bounded worker
//! pool, records completion, and deletes the bucket object.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bucket::ObjectStore;
use crate::error::{Result, SyncError};
use crate::planner::TaskPlan;
use crate::reconcile::{move_file, CopyMode};
use crate::store::{TaskRecord, TaskStatus, TaskStore};

/// Routes a virtual name to a category subdirectory under the destination
/// root. Pure; supplied alongside configuration.
pub type SubdirRouter = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// The stock category router.
#[must_use]
pub fn default_subdir_router() -> SubdirRouter {
    Arc::new(|virtual_name: &str| {
        if virtual_name.contains(".idx") || virtual_name.contains(".bin") {
            "All.blobs".to_string()
        } else if virtual_name.contains(".s") {
            "gz".to_string()
        } else if virtual_name.starts_with("sha1.") {
            "All.sha1o".to_string()
        } else if virtual_name.contains("Full") {
            "basemaps".to_string()
        } else {
            "All.sha1c".to_string()
        }
    })
}

/// Options for a receive run.
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    /// Directory downloads land in before placement.
    pub cache_dir: PathBuf,
    /// Root for routed placements when a task has no explicit target.
    pub dest_root: PathBuf,
    /// Delay between reconcile passes while downloads run.
    pub reconcile_interval: Duration,
    /// Reconcile worker pool width.
    pub workers: usize,
    /// Concurrent downloads.
    pub download_concurrency: usize,
}

impl ReceiverOptions {
    /// Options with stock tuning for the given directories.
    #[must_use]
    pub fn new(cache_dir: PathBuf, dest_root: PathBuf) -> Self {
        Self {
            cache_dir,
            dest_root,
            reconcile_interval: Duration::from_secs(120),
            workers: 10,
            download_concurrency: 4,
        }
    }
}

/// A cache file matched to its task and resolved destination.
struct Placement {
    virtual_name: String,
    staged: PathBuf,
    dest: PathBuf,
    mode: CopyMode,
    expected_digest: Option<String>,
    expected_dst_size: Option<u64>,
    record: TaskRecord,
}

/// Walk the cache directory and match files against the plan.
fn scan_cache(plan: &TaskPlan, opts: &ReceiverOptions, router: &SubdirRouter) -> Vec<Placement> {
    let mut placements = Vec::new();
    if !opts.cache_dir.is_dir() {
        debug!(cache = %opts.cache_dir.display(), "Cache directory does not exist");
        return placements;
    }
    for entry in walkdir::WalkDir::new(&opts.cache_dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(&opts.cache_dir) else {
            continue;
        };
        let virtual_name = rel.to_string_lossy().replace('\\', "/");
        let Some(task) = plan.get(&virtual_name) else {
            debug!(virtual_name = %virtual_name, "No task for cached file");
            continue;
        };
        let actual_size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if actual_size != task.size {
            warn!(
                virtual_name = %virtual_name,
                expected = task.size,
                actual = actual_size,
                "Cached file size mismatch, skipping"
            );
            continue;
        }

        let dest = match &task.target_path {
            Some(target) if !target.is_empty() => PathBuf::from(target),
            _ => opts
                .dest_root
                .join(router(&virtual_name))
                .join(&virtual_name),
        };
        let mode = if task.is_append() {
            CopyMode::Append
        } else {
            CopyMode::Overwrite
        };
        placements.push(Placement {
            virtual_name: virtual_name.clone(),
            staged: entry.path().to_path_buf(),
            dest: dest.clone(),
            mode,
            expected_digest: task.source_digest.clone(),
            expected_dst_size: task.is_append().then_some(task.offset),
            record: TaskRecord {
                virtual_name,
                source_path: task.source_path.clone(),
                source_size: task.size,
                source_digest: task.source_digest.clone().unwrap_or_default(),
                destination_path: dest.to_string_lossy().into_owned(),
                destination_size: task.size,
                status: TaskStatus::Downloaded,
                error: String::new(),
            },
        });
    }
    placements
}

/// One sweep over the cache directory.
///
/// Per-file failures are logged and retried on the next pass; the pass only
/// fails on cancellation. Returns the number of files placed.
///
/// # Errors
///
/// Returns [`SyncError::Cancelled`] when the token fires; in-flight
/// placements finish first.
pub async fn reconcile_pass(
    plan: &TaskPlan,
    store: Option<Arc<dyn TaskStore>>,
    bucket: Arc<dyn ObjectStore>,
    router: &SubdirRouter,
    opts: &ReceiverOptions,
    token: &CancellationToken,
) -> Result<usize> {
    let placements = scan_cache(plan, opts, router);
    if placements.is_empty() {
        debug!("No completed downloads in cache");
        return Ok(0);
    }
    info!(count = placements.len(), "Reconciling completed downloads");

    let semaphore = Arc::new(Semaphore::new(opts.workers.max(1)));
    let mut joinset: JoinSet<bool> = JoinSet::new();

    for placement in placements {
        if token.is_cancelled() {
            break;
        }
        let semaphore = Arc::clone(&semaphore);
        let store = store.clone();
        let bucket = Arc::clone(&bucket);
        let token = token.clone();
        joinset.spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return false;
            };
            if token.is_cancelled() {
                return false;
            }
            if let Some(parent) = placement.dest.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!(dest = %placement.dest.display(), error = %e, "Cannot create destination directory");
                    return false;
                }
            }

            let staged = placement.staged.clone();
            let dest = placement.dest.clone();
            let mode = placement.mode;
            let digest = placement.expected_digest.clone();
            let size = placement.expected_dst_size;
            let moved = tokio::task::spawn_blocking(move || {
                move_file(&staged, &dest, mode, digest.as_deref(), size)
            })
            .await;

            match moved {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(virtual_name = %placement.virtual_name, error = %e, "Placement failed, will retry");
                    return false;
                }
                Err(e) => {
                    warn!(virtual_name = %placement.virtual_name, error = %e, "Placement worker panicked");
                    return false;
                }
            }

            if let Some(store) = &store {
                if let Err(e) = store.upsert(&placement.record) {
                    warn!(virtual_name = %placement.virtual_name, error = %e, "Could not record completion");
                    return false;
                }
            }
            // Placed and recorded; the bucket object is now redundant.
            if let Err(e) = bucket.delete(&placement.virtual_name).await {
                warn!(virtual_name = %placement.virtual_name, error = %e, "Bucket delete failed, will retry next run");
            }
            info!(virtual_name = %placement.virtual_name, "Task downloaded");
            true
        });
    }

    let mut placed = 0usize;
    while let Some(joined) = joinset.join_next().await {
        if matches!(joined, Ok(true)) {
            placed += 1;
        }
    }

    if token.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    Ok(placed)
}

/// Download `names` from the bucket into the cache directory.
async fn download_all(
    bucket: Arc<dyn ObjectStore>,
    cache_dir: PathBuf,
    names: Vec<String>,
    concurrency: usize,
    token: CancellationToken,
) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut joinset = JoinSet::new();

    for name in names {
        if token.is_cancelled() {
            break;
        }
        let bucket = Arc::clone(&bucket);
        let semaphore = Arc::clone(&semaphore);
        let token = token.clone();
        let local = cache_dir.join(&name);
        joinset.spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return Err(SyncError::Cancelled);
            };
            if token.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            debug!(object = %name, "Downloading");
            bucket.download(&name, &local).await
        });
    }

    let mut failed = 0usize;
    while let Some(joined) = joinset.join_next().await {
        match joined {
            Ok(Ok(())) | Ok(Err(SyncError::Cancelled)) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "Download failed");
                failed += 1;
            }
            Err(e) => {
                warn!(error = %e, "Download worker panicked");
                failed += 1;
            }
        }
    }

    if token.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    if failed > 0 {
        return Err(SyncError::Transport(format!("{failed} downloads failed")));
    }
    Ok(())
}

/// Run the receiver: clean up retired objects, download outstanding ones,
/// and reconcile concurrently until both sides are drained.
///
/// # Errors
///
/// Fails on store/bucket listing errors, a download summary error, or
/// cancellation. Reconcile-pass failures are retried, not surfaced.
pub async fn run_recv(
    plan: &TaskPlan,
    store: Option<Arc<dyn TaskStore>>,
    bucket: Arc<dyn ObjectStore>,
    router: &SubdirRouter,
    opts: &ReceiverOptions,
    token: &CancellationToken,
) -> Result<()> {
    std::fs::create_dir_all(&opts.cache_dir)?;

    let completed: HashSet<String> = match &store {
        Some(store) => store.finished_virtual_names()?.into_iter().collect(),
        None => HashSet::new(),
    };

    // Pick up anything a previous run left in the cache.
    match reconcile_pass(plan, store.clone(), Arc::clone(&bucket), router, opts, token).await {
        Ok(_) => {}
        Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
        Err(e) => warn!(error = %e, "Initial reconcile pass failed"),
    }

    let objects = bucket.list().await?;
    let mut file_list = Vec::new();
    for object in objects {
        if completed.contains(&object.name) {
            // Retired but the delete never landed; re-attempt, best-effort.
            debug!(object = %object.name, "Already placed, deleting leftover object");
            if let Err(e) = bucket.delete(&object.name).await {
                warn!(object = %object.name, error = %e, "Leftover delete failed");
            }
            continue;
        }
        let Some(task) = plan.get(&object.name) else {
            debug!(object = %object.name, "No task for bucket object");
            continue;
        };
        if task.size != object.size {
            warn!(
                object = %object.name,
                expected = task.size,
                actual = object.size,
                "Object size mismatch, skipping"
            );
            continue;
        }
        file_list.push(object.name);
    }

    info!(count = file_list.len(), "Objects to download");
    let mut downloader = tokio::spawn(download_all(
        Arc::clone(&bucket),
        opts.cache_dir.clone(),
        file_list,
        opts.download_concurrency,
        token.clone(),
    ));

    loop {
        match reconcile_pass(plan, store.clone(), Arc::clone(&bucket), router, opts, token).await {
            Ok(placed) if placed > 0 => debug!(placed, "Reconcile pass complete"),
            Ok(_) => {}
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            Err(e) => warn!(error = %e, "Reconcile pass failed, will retry"),
        }

        tokio::select! {
            joined = &mut downloader => {
                let download_result = match joined {
                    Ok(res) => res,
                    Err(e) => Err(SyncError::Transport(format!("downloader panicked: {e}"))),
                };
                // One final pass over whatever the downloader delivered.
                let final_result =
                    reconcile_pass(plan, store.clone(), Arc::clone(&bucket), router, opts, token)
                        .await;
                download_result?;
                final_result?;
                info!("Receive run complete");
                return Ok(());
            }
            () = token.cancelled() => {
                info!("Receive cancelled");
                return Err(SyncError::Cancelled);
            }
            () = tokio::time::sleep(opts.reconcile_interval) => {}
        }
    }
}
