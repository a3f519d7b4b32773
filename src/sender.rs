//! Sender pipeline.
//!
//! Registers the planned tasks in the progress store, exposes every source
//! window through a read-only offset-view mount, drives the object-store
//! uploader over the mount, and records completion.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bucket::ObjectStore;
use crate::error::{Result, SyncError};
use crate::offsetfs::{self, Window};
use crate::planner::{SyncTask, TaskPlan};
use crate::store::{TaskRecord, TaskStatus, TaskStore};

/// Options for a send run.
#[derive(Debug, Clone)]
pub struct SenderOptions {
    /// Where the offset-view filesystem is mounted.
    pub mountpoint: PathBuf,
    /// Pass `allow_other` to the mount.
    pub allow_other: bool,
    /// Concurrent uploads.
    pub concurrency: usize,
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self {
            mountpoint: PathBuf::from("/tmp/shardsync_offsetfs"),
            allow_other: false,
            concurrency: 4,
        }
    }
}

/// Build the record registered for `task` at `status`.
fn record_for(task: &SyncTask, status: TaskStatus) -> TaskRecord {
    TaskRecord {
        virtual_name: task.virtual_name.clone(),
        source_path: task.source_path.clone(),
        source_size: task.size,
        source_digest: task.source_digest.clone().unwrap_or_default(),
        destination_path: task.target_path.clone().unwrap_or_default(),
        destination_size: task.offset,
        status,
        error: String::new(),
    }
}

/// Read-only VFS windows covering every task in the plan.
fn windows_from_plan(plan: &TaskPlan) -> FxHashMap<String, Window> {
    plan.values()
        .map(|task| {
            (
                task.virtual_name.clone(),
                Window {
                    virtual_path: task.virtual_name.clone(),
                    source_path: PathBuf::from(&task.source_path),
                    offset: task.offset,
                    size: task.size,
                    read_only: true,
                },
            )
        })
        .collect()
}

/// Upload every plan entry from `source_dir` into the bucket.
///
/// Failures are counted per object and surfaced at the end of the batch;
/// cancellation stops new transfers from being issued.
///
/// # Errors
///
/// Returns [`SyncError::Cancelled`] when the token fires, or
/// [`SyncError::Transport`] naming the failure count once the batch ends.
pub async fn upload_tasks(
    bucket: Arc<dyn ObjectStore>,
    source_dir: &Path,
    plan: &TaskPlan,
    concurrency: usize,
    token: &CancellationToken,
) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut joinset = JoinSet::new();

    for name in plan.keys() {
        if token.is_cancelled() {
            break;
        }
        let bucket = Arc::clone(&bucket);
        let semaphore = Arc::clone(&semaphore);
        let token = token.clone();
        let local = source_dir.join(name);
        let name = name.clone();
        joinset.spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return Err(SyncError::Cancelled);
            };
            if token.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            debug!(object = %name, "Uploading");
            bucket.upload(&local, &name).await
        });
    }

    let mut failed = 0usize;
    while let Some(joined) = joinset.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(SyncError::Cancelled)) => {}
            Ok(Err(e)) => {
                error!(error = %e, "Upload failed");
                failed += 1;
            }
            Err(e) => {
                error!(error = %e, "Upload worker panicked");
                failed += 1;
            }
        }
    }

    if token.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    if failed > 0 {
        return Err(SyncError::Transport(format!("{failed} uploads failed")));
    }
    Ok(())
}

/// Run the sender: register, mount, upload, record, unmount.
///
/// Tasks already `downloaded` in the store are elided, so re-runs upload
/// only outstanding work. No task is marked `uploaded` after cancellation.
///
/// # Errors
///
/// Any store upsert failure is fatal, as is a mount failure; upload failures
/// surface as a single [`SyncError::Transport`] at the end of the batch.
pub async fn run_send(
    plan: &TaskPlan,
    store: Option<&dyn TaskStore>,
    bucket: Arc<dyn ObjectStore>,
    opts: &SenderOptions,
    token: &CancellationToken,
) -> Result<()> {
    let mut plan = plan.clone();
    if let Some(store) = store {
        for name in store.finished_virtual_names()? {
            if plan.remove(&name).is_some() {
                debug!(virtual_name = %name, "Already placed on destination, skipping");
            }
        }
    }
    if plan.is_empty() {
        info!("No outstanding tasks to upload");
        return Ok(());
    }

    if let Some(store) = store {
        for task in plan.values() {
            store.upsert(&record_for(task, TaskStatus::Uploading))?;
            info!(virtual_name = %task.virtual_name, size = task.size, "Task registered as uploading");
        }
    }

    offsetfs::prepare_mountpoint(&opts.mountpoint)?;
    let mount = offsetfs::mount_background(
        windows_from_plan(&plan),
        &opts.mountpoint,
        true,
        opts.allow_other,
    )?;

    info!(count = plan.len(), "Uploading objects");
    let upload_result = upload_tasks(
        bucket,
        &opts.mountpoint,
        &plan,
        opts.concurrency,
        token,
    )
    .await;

    mount.unmount();
    offsetfs::lazy_unmount(&opts.mountpoint);

    match upload_result {
        Ok(()) => {
            if let Some(store) = store {
                for task in plan.values() {
                    if token.is_cancelled() {
                        return Err(SyncError::Cancelled);
                    }
                    store.upsert(&record_for(task, TaskStatus::Uploaded))?;
                    info!(virtual_name = %task.virtual_name, "Task uploaded");
                }
            }
            info!(count = plan.len(), "Upload batch complete");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "Upload batch did not complete");
            Err(e)
        }
    }
}
